use super::{downstream, record, DocumentStore, Notification, Notifier};
use crate::dispatch::{EventContext, EventHandler, HandlerError, HandlerResult};
use crate::messaging::NewOrderCreation;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

/// Records orders and sends a confirmation when the customer left an address
pub struct OrderCreationHandler {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
}

impl OrderCreationHandler {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    fn confirmation_body(event: &NewOrderCreation) -> String {
        let mut body = format!("Thanks for your order {}.\n\n", event.order_number);
        for line in &event.lines {
            let _ = writeln!(
                body,
                "  {} x {} @ {:.2} = {:.2}",
                line.quantity,
                line.description,
                line.unit_price,
                line.line_total()
            );
        }
        let _ = writeln!(body, "\nTotal: {:.2} {}", event.total, event.currency);
        body
    }
}

#[async_trait]
impl EventHandler<NewOrderCreation> for OrderCreationHandler {
    async fn handle(&self, ctx: &EventContext, event: &NewOrderCreation) -> HandlerResult {
        if event.order_id.is_empty() {
            return Err(HandlerError::Invalid("order without id".to_string()));
        }

        record(self.store.as_ref(), "orders", ctx, event).await?;

        match event.customer_email.as_deref().filter(|email| !email.is_empty()) {
            Some(email) => {
                let notification = Notification {
                    to: vec![email.to_string()],
                    subject: format!("Order {} confirmed", event.order_number),
                    body: Self::confirmation_body(event),
                };
                self.notifier.send(&notification).await.map_err(downstream)?;
                info!(order_id = %event.order_id, "Order confirmation sent");
            }
            None => debug!(order_id = %event.order_id, "No customer email, skipping confirmation"),
        }

        Ok(())
    }
}
