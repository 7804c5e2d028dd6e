//! Event dispatch: typed handlers, retry policy and the consumer orchestrator
//!
//! Every registered event kind gets one subscription on its work queue.
//! Deliveries are decoded into an [`EventEnvelope`](crate::messaging::EventEnvelope),
//! routed to the handler for their kind, and settled exactly once: ack on
//! success, otherwise whatever the [`RetryPolicy`] decides.

mod consumer;
mod handler;
mod orchestrator;
mod retry;

pub use consumer::Disposition;
pub use handler::{EventContext, EventHandler, HandlerError, HandlerRegistry, HandlerResult};
pub use orchestrator::{ConsumerOrchestrator, OrchestratorState, OrchestratorStatus};
pub use retry::{FailureAction, RetryPolicy};

use std::time::Duration;

/// Consumer-side tuning
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    /// `None` lets handlers run unbounded
    pub handler_timeout: Option<Duration>,
    pub consumer_tag_prefix: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            handler_timeout: Some(Duration::from_secs(30)),
            consumer_tag_prefix: "storefront-dispatcher".to_string(),
        }
    }
}
