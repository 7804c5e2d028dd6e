//! Typed event handlers and their registry

use crate::messaging::{
    DomainEvent, EventKind, EventPayload, InvoiceGeneration, LowStockAlert,
    NewCustomerRegistration, NewOrderCreation, NewProductCreation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Why a handler did not complete
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Business logic failed; worth retrying
    #[error("Handler failed: {0}")]
    Failed(String),

    /// A downstream collaborator (store, mail relay) was unavailable
    #[error("Downstream unavailable: {0}")]
    Downstream(String),

    /// The handler exceeded its execution deadline
    #[error("Handler timed out after {0:?}")]
    TimedOut(Duration),

    /// The payload can never be processed; retrying will not help
    #[error("Invalid event: {0}")]
    Invalid(String),

    /// No handler is registered for the kind
    #[error("No handler registered for {0}")]
    NotRegistered(EventKind),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Invalid(_) | HandlerError::NotRegistered(_))
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Envelope metadata handed to every handler
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    /// 1 on first delivery
    pub attempt: u32,
    pub redelivered: bool,
}

/// Handles events of one kind
#[async_trait]
pub trait EventHandler<E: EventPayload>: Send + Sync {
    async fn handle(&self, ctx: &EventContext, event: &E) -> HandlerResult;
}

/// At most one handler per event kind.
///
/// Dispatch matches exhaustively on [`DomainEvent`], so a new kind does not
/// compile until it has a slot here.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    low_stock_alert: Option<Arc<dyn EventHandler<LowStockAlert>>>,
    new_customer_registration: Option<Arc<dyn EventHandler<NewCustomerRegistration>>>,
    new_product_creation: Option<Arc<dyn EventHandler<NewProductCreation>>>,
    new_order_creation: Option<Arc<dyn EventHandler<NewOrderCreation>>>,
    invoice_generation: Option<Arc<dyn EventHandler<InvoiceGeneration>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_low_stock_alert<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<LowStockAlert> + 'static,
    {
        self.low_stock_alert = Some(Arc::new(handler));
        self
    }

    pub fn on_new_customer_registration<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<NewCustomerRegistration> + 'static,
    {
        self.new_customer_registration = Some(Arc::new(handler));
        self
    }

    pub fn on_new_product_creation<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<NewProductCreation> + 'static,
    {
        self.new_product_creation = Some(Arc::new(handler));
        self
    }

    pub fn on_new_order_creation<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<NewOrderCreation> + 'static,
    {
        self.new_order_creation = Some(Arc::new(handler));
        self
    }

    pub fn on_invoice_generation<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<InvoiceGeneration> + 'static,
    {
        self.invoice_generation = Some(Arc::new(handler));
        self
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::LowStockAlert => self.low_stock_alert.is_some(),
            EventKind::NewCustomerRegistration => self.new_customer_registration.is_some(),
            EventKind::NewProductCreation => self.new_product_creation.is_some(),
            EventKind::NewOrderCreation => self.new_order_creation.is_some(),
            EventKind::InvoiceGeneration => self.invoice_generation.is_some(),
        }
    }

    /// Kinds with a handler, in declaration order
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        EventKind::all()
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect()
    }

    /// Route an event to the handler for its kind
    pub async fn dispatch(&self, ctx: &EventContext, event: &DomainEvent) -> HandlerResult {
        match event {
            DomainEvent::LowStockAlert(e) => invoke(&self.low_stock_alert, ctx, e).await,
            DomainEvent::NewCustomerRegistration(e) => {
                invoke(&self.new_customer_registration, ctx, e).await
            }
            DomainEvent::NewProductCreation(e) => invoke(&self.new_product_creation, ctx, e).await,
            DomainEvent::NewOrderCreation(e) => invoke(&self.new_order_creation, ctx, e).await,
            DomainEvent::InvoiceGeneration(e) => invoke(&self.invoice_generation, ctx, e).await,
        }
    }
}

async fn invoke<E: EventPayload>(
    slot: &Option<Arc<dyn EventHandler<E>>>,
    ctx: &EventContext,
    event: &E,
) -> HandlerResult {
    match slot {
        Some(handler) => handler.handle(ctx, event).await,
        None => Err(HandlerError::NotRegistered(E::KIND)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<NewCustomerRegistration> for CountingHandler {
        async fn handle(&self, _ctx: &EventContext, event: &NewCustomerRegistration) -> HandlerResult {
            if event.email.is_empty() {
                return Err(HandlerError::Invalid("missing email".to_string()));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx() -> EventContext {
        EventContext {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            attempt: 1,
            redelivered: false,
        }
    }

    fn customer(email: &str) -> DomainEvent {
        DomainEvent::NewCustomerRegistration(NewCustomerRegistration {
            customer_id: "C-1".to_string(),
            name: "Ada".to_string(),
            email: email.to_string(),
            phone: None,
        })
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().on_new_customer_registration(CountingHandler {
            calls: calls.clone(),
        });

        registry.dispatch(&ctx(), &customer("ada@example.com")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.registered_kinds(), vec![EventKind::NewCustomerRegistration]);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_not_retryable() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(&ctx(), &customer("ada@example.com")).await.unwrap_err();

        assert!(matches!(err, HandlerError::NotRegistered(EventKind::NewCustomerRegistration)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_errors_propagate() {
        let registry = HandlerRegistry::new().on_new_customer_registration(CountingHandler::default());
        let err = registry.dispatch(&ctx(), &customer("")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HandlerError::Failed("boom".into()).is_retryable());
        assert!(HandlerError::Downstream("smtp".into()).is_retryable());
        assert!(HandlerError::TimedOut(Duration::from_secs(1)).is_retryable());
    }
}
