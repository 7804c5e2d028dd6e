use super::{record, DocumentStore};
use crate::dispatch::{EventContext, EventHandler, HandlerError, HandlerResult};
use crate::messaging::NewProductCreation;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct ProductCreationHandler {
    store: Arc<dyn DocumentStore>,
}

impl ProductCreationHandler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler<NewProductCreation> for ProductCreationHandler {
    async fn handle(&self, ctx: &EventContext, event: &NewProductCreation) -> HandlerResult {
        if !event.price.is_finite() || event.price < 0.0 {
            return Err(HandlerError::Invalid(format!(
                "product {} has invalid price {}",
                event.product_id, event.price
            )));
        }

        record(self.store.as_ref(), "products", ctx, event).await?;
        info!(product_id = %event.product_id, initial_stock = event.initial_stock, "Product recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::InMemoryDocumentStore;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_negative_price_is_invalid() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let handler = ProductCreationHandler::new(store.clone());
        let ctx = EventContext {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            attempt: 1,
            redelivered: false,
        };
        let event = NewProductCreation {
            product_id: "P-1".to_string(),
            name: "Lamp".to_string(),
            sku: None,
            price: -1.0,
            currency: "USD".to_string(),
            initial_stock: 3,
        };

        let err = handler.handle(&ctx, &event).await.unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
        assert_eq!(store.count("products").await.unwrap(), 0);
    }
}
