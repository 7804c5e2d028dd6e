use super::{downstream, record, DocumentStore, Notification, Notifier};
use crate::dispatch::{EventContext, EventHandler, HandlerError, HandlerResult};
use crate::messaging::LowStockAlert;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Records low-stock alerts and mails operations
pub struct LowStockAlertHandler {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl LowStockAlertHandler {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        Self {
            store,
            notifier,
            recipients,
        }
    }
}

#[async_trait]
impl EventHandler<LowStockAlert> for LowStockAlertHandler {
    async fn handle(&self, ctx: &EventContext, event: &LowStockAlert) -> HandlerResult {
        if event.product_id.is_empty() {
            return Err(HandlerError::Invalid("low stock alert without product id".to_string()));
        }

        record(self.store.as_ref(), "low_stock_alerts", ctx, event).await?;

        if self.recipients.is_empty() {
            warn!(product_id = %event.product_id, "No alert recipients configured");
            return Ok(());
        }

        let sku = event.sku.as_deref().unwrap_or("n/a");
        let notification = Notification {
            to: self.recipients.clone(),
            subject: format!("Low stock: {}", event.product_name),
            body: format!(
                "{} (SKU {}) is down to {} units; the reorder threshold is {}.\n\nProduct ID: {}\n",
                event.product_name, sku, event.current_stock, event.threshold, event.product_id
            ),
        };
        self.notifier.send(&notification).await.map_err(downstream)?;

        info!(product_id = %event.product_id, current_stock = event.current_stock, "Low stock alert sent");
        Ok(())
    }
}
