//! Event publisher

use crate::messaging::connection::ConnectionManager;
use crate::messaging::error::MessagingResult;
use crate::messaging::events::{DomainEvent, EventEnvelope};
use crate::messaging::message::{OutboundMessage, CONTENT_TYPE_JSON};
use crate::messaging::metrics::{
    EVENTS_PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL, PUBLISH_LATENCY_SECONDS,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Publishes event envelopes on the topic exchange
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Publish an envelope on its kind's routing key.
    ///
    /// Connects lazily. `Ok(true)` means the broker took the message for
    /// local buffering (or confirmed it, when confirms are enabled); it is
    /// not proof the message reached durable storage.
    pub async fn publish(&self, envelope: &EventEnvelope) -> MessagingResult<bool> {
        let kind = envelope.kind();
        let start = Instant::now();

        let result = self.publish_inner(envelope).await;

        match &result {
            Ok(accepted) => {
                EVENTS_PUBLISHED_TOTAL.with_label_values(&[kind.as_ref()]).inc();
                PUBLISH_LATENCY_SECONDS
                    .with_label_values(&[kind.as_ref()])
                    .observe(start.elapsed().as_secs_f64());
                if !accepted {
                    warn!(event_kind = %kind, event_id = %envelope.id, "Broker declined published event");
                }
            }
            Err(e) => {
                PUBLISH_FAILURES_TOTAL.with_label_values(&[kind.as_ref()]).inc();
                error!(event_kind = %kind, event_id = %envelope.id, error = %e, "Failed to publish event");
            }
        }

        result
    }

    /// Wrap an event in a fresh envelope and publish it
    pub async fn publish_event(&self, event: impl Into<DomainEvent>) -> MessagingResult<EventEnvelope> {
        let envelope = EventEnvelope::new(event);
        self.publish(&envelope).await?;
        Ok(envelope)
    }

    async fn publish_inner(&self, envelope: &EventEnvelope) -> MessagingResult<bool> {
        let kind = envelope.kind();
        let topology = self.connection.topology();
        let entry = topology.entry(kind)?;

        let channel = self.connection.connect().await?;

        let message = OutboundMessage {
            body: envelope.to_bytes()?,
            message_id: envelope.id.to_string(),
            timestamp: envelope.occurred_at,
            event_type: kind.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            attempt: 1,
        };

        let accepted = channel
            .publish(topology.exchange(), &entry.routing_key, message)
            .await?;

        info!(
            event_kind = %kind,
            event_id = %envelope.id,
            entity_id = %envelope.event.entity_id(),
            routing_key = %entry.routing_key,
            accepted,
            "Event published"
        );
        Ok(accepted)
    }
}
