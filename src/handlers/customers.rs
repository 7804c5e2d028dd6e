use super::{downstream, record, DocumentStore, Notification, Notifier};
use crate::dispatch::{EventContext, EventHandler, HandlerError, HandlerResult};
use crate::messaging::NewCustomerRegistration;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Records new customers and sends the welcome mail
pub struct CustomerRegistrationHandler {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
}

impl CustomerRegistrationHandler {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl EventHandler<NewCustomerRegistration> for CustomerRegistrationHandler {
    async fn handle(&self, ctx: &EventContext, event: &NewCustomerRegistration) -> HandlerResult {
        if event.email.trim().is_empty() {
            return Err(HandlerError::Invalid(format!(
                "customer {} registered without an email",
                event.customer_id
            )));
        }

        record(self.store.as_ref(), "customers", ctx, event).await?;

        let notification = Notification {
            to: vec![event.email.clone()],
            subject: "Welcome to the store".to_string(),
            body: format!(
                "Hi {},\n\nThanks for creating an account. Your customer number is {}.\n",
                event.name, event.customer_id
            ),
        };
        self.notifier.send(&notification).await.map_err(downstream)?;

        info!(customer_id = %event.customer_id, "Welcome mail sent");
        Ok(())
    }
}
