use super::{downstream, DocumentStore, Notification, Notifier};
use crate::dispatch::{EventContext, EventHandler, HandlerError, HandlerResult};
use crate::messaging::InvoiceGeneration;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

const RULE: &str = "------------------------------------------------------------";

/// Render a plain-text invoice from the order snapshot
pub fn render_invoice(event: &InvoiceGeneration) -> String {
    let order = &event.order;
    let mut out = String::new();

    let _ = writeln!(out, "INVOICE {}", event.order_number);
    let _ = writeln!(out, "Order ID: {}", event.order_id);
    let _ = writeln!(out, "Order date: {}", order.placed_at.format("%Y-%m-%d %H:%M UTC"));
    if let Some(customer) = event.customer_id.as_deref().or(event.customer_email.as_deref()) {
        let _ = writeln!(out, "Customer: {}", customer);
    }
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "{:<32} {:>5} {:>10} {:>10}", "Item", "Qty", "Unit", "Amount");
    for line in &order.lines {
        let _ = writeln!(
            out,
            "{:<32} {:>5} {:>10.2} {:>10.2}",
            truncate(&line.description, 32),
            line.quantity,
            line.unit_price,
            line.line_total()
        );
    }
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "{:<49} {:>10.2}", "Subtotal", order.subtotal);
    let _ = writeln!(out, "{:<49} {:>10.2}", "Tax", order.tax);
    let _ = writeln!(out, "{:<49} {:>10.2}", format!("Total ({})", order.currency), order.total);

    out
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width - 1).collect();
        cut.push('~');
        cut
    }
}

/// Renders, stores and mails invoices
pub struct InvoiceHandler {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
}

impl InvoiceHandler {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl EventHandler<InvoiceGeneration> for InvoiceHandler {
    async fn handle(&self, ctx: &EventContext, event: &InvoiceGeneration) -> HandlerResult {
        if event.order.lines.is_empty() {
            return Err(HandlerError::Invalid(format!(
                "invoice for order {} has no lines",
                event.order_id
            )));
        }

        let document = render_invoice(event);
        let record = json!({
            "event_id": ctx.event_id,
            "order_id": event.order_id,
            "order_number": event.order_number,
            "total": event.order.total,
            "currency": event.order.currency,
            "document": document,
            "rendered_at": Utc::now(),
        });
        self.store
            .put("invoices", &ctx.event_id.to_string(), &record)
            .await
            .map_err(downstream)?;

        match event.customer_email.as_deref().filter(|email| !email.is_empty()) {
            Some(email) => {
                let notification = Notification {
                    to: vec![email.to_string()],
                    subject: format!("Invoice for order {}", event.order_number),
                    body: document,
                };
                self.notifier.send(&notification).await.map_err(downstream)?;
                info!(order_id = %event.order_id, "Invoice mailed");
            }
            None => debug!(order_id = %event.order_id, "Invoice stored, no customer email"),
        }

        Ok(())
    }
}
