//! Messages as they cross the broker boundary

use crate::messaging::error::MessagingResult;
use crate::messaging::traits::Acknowledger;
use chrono::{DateTime, Utc};
use std::fmt;

/// Header carrying the delivery attempt number
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// Content type of encoded envelopes
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Encoded envelope
    pub body: Vec<u8>,

    /// Envelope id, set as the transport message id
    pub message_id: String,

    /// Envelope timestamp, set as the transport timestamp
    pub timestamp: DateTime<Utc>,

    /// Event kind name, set as the transport message type
    pub event_type: String,

    pub content_type: String,

    /// Survive a broker restart
    pub persistent: bool,

    /// 1 for the first delivery, incremented on every republish
    pub attempt: u32,
}

impl OutboundMessage {
    /// Copy of this message for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// A message received from a queue, awaiting exactly one terminal action.
///
/// `ack` and `nack` take the delivery by value.
pub struct Delivery {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub redelivered: bool,
    pub attempt: u32,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            message_id: None,
            timestamp: None,
            event_type: None,
            redelivered: false,
            attempt: 1,
            delivery_tag,
            acker,
        }
    }

    /// Remove the message from the queue
    pub async fn ack(self) -> MessagingResult<()> {
        self.acker.ack().await
    }

    /// Reject the message, optionally returning it to the queue
    pub async fn nack(self, requeue: bool) -> MessagingResult<()> {
        self.acker.nack(requeue).await
    }

    /// Rebuild a publishable message from this delivery. `fallback_id` is
    /// used when the producer set no message id.
    pub fn to_outbound(&self, fallback_id: &str) -> OutboundMessage {
        OutboundMessage {
            body: self.body.clone(),
            message_id: self
                .message_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_id.to_string()),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event_type: self.event_type.clone().unwrap_or_default(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            attempt: self.attempt,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("event_type", &self.event_type)
            .field("redelivered", &self.redelivered)
            .field("attempt", &self.attempt)
            .field("body_len", &self.body.len())
            .finish()
    }
}
