//! Event handlers and their downstream collaborators
//!
//! Handlers stay thin: record the event in the document store keyed by
//! event id, then mail whoever needs to know.

mod catalog;
mod customers;
mod inventory;
mod invoicing;
mod notifier;
mod orders;
mod store;

pub use catalog::ProductCreationHandler;
pub use customers::CustomerRegistrationHandler;
pub use inventory::LowStockAlertHandler;
pub use invoicing::{render_invoice, InvoiceHandler};
pub use notifier::{Notification, Notifier, RecordingNotifier, SmtpNotifier};
pub use orders::OrderCreationHandler;
pub use store::{build_store, DocumentStore, InMemoryDocumentStore, SledDocumentStore};

use crate::dispatch::{EventContext, HandlerError, HandlerRegistry};
use crate::error::AppError;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Register one handler per event kind
pub fn build_registry(
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    alert_recipients: Vec<String>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .on_low_stock_alert(LowStockAlertHandler::new(
            store.clone(),
            notifier.clone(),
            alert_recipients,
        ))
        .on_new_customer_registration(CustomerRegistrationHandler::new(
            store.clone(),
            notifier.clone(),
        ))
        .on_new_product_creation(ProductCreationHandler::new(store.clone()))
        .on_new_order_creation(OrderCreationHandler::new(store.clone(), notifier.clone()))
        .on_invoice_generation(InvoiceHandler::new(store, notifier))
}

/// Store `payload` under the event id
async fn record<T: Serialize>(
    store: &dyn DocumentStore,
    collection: &str,
    ctx: &EventContext,
    payload: &T,
) -> Result<(), HandlerError> {
    let document = json!({
        "event_id": ctx.event_id,
        "occurred_at": ctx.occurred_at,
        "recorded_at": Utc::now(),
        "payload": payload,
    });
    store
        .put(collection, &ctx.event_id.to_string(), &document)
        .await
        .map_err(downstream)
}

fn downstream(err: AppError) -> HandlerError {
    match err {
        AppError::Validation(msg) => HandlerError::Invalid(msg),
        other => HandlerError::Downstream(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{DomainEvent, EventKind, NewCustomerRegistration};
    use uuid::Uuid;

    fn ctx() -> EventContext {
        EventContext {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            attempt: 1,
            redelivered: false,
        }
    }

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = build_registry(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingNotifier::new()),
            vec![],
        );
        assert_eq!(registry.registered_kinds(), EventKind::all());
    }

    #[tokio::test]
    async fn test_redelivery_overwrites_same_document() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let notifier = RecordingNotifier::new();
        let registry = build_registry(store.clone(), Arc::new(notifier.clone()), vec![]);

        let event = DomainEvent::NewCustomerRegistration(NewCustomerRegistration {
            customer_id: "C-1".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            phone: None,
        });
        let ctx = ctx();

        registry.dispatch(&ctx, &event).await.unwrap();
        registry.dispatch(&ctx, &event).await.unwrap();

        assert_eq!(store.count("customers").await.unwrap(), 1);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[test]
    fn test_validation_maps_to_invalid() {
        let err = downstream(AppError::Validation("bad address".to_string()));
        assert!(!err.is_retryable());

        let err = downstream(AppError::Storage("disk full".to_string()));
        assert!(err.is_retryable());
    }
}
