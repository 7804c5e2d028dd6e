pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::dispatch::ConsumerOrchestrator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state of the liveness surface.
///
/// Holds no broker handle of its own; the orchestrator is only read for the
/// diagnostic section of the status page.
#[derive(Clone)]
pub struct LivenessState {
    pub service: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub orchestrator: Option<Arc<ConsumerOrchestrator>>,
}

impl LivenessState {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            orchestrator: None,
        }
    }

    /// Attach the orchestrator for the status page
    pub fn with_orchestrator(mut self, orchestrator: Arc<ConsumerOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
