//! Broker trait abstractions

use crate::messaging::error::MessagingResult;
use crate::messaging::message::{Delivery, OutboundMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens connections to a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new connection. Every call yields a fresh instance.
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerConnection>>;
}

/// A live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection
    async fn create_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>>;

    /// Check if the connection is still open
    fn is_connected(&self) -> bool;

    /// Close the connection; cancels every consumer on it
    async fn close(&self) -> MessagingResult<()>;
}

/// A channel: the unit through which declarations, publishes and
/// subscriptions are issued
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange
    async fn declare_exchange(&self, name: &str, durable: bool) -> MessagingResult<()>;

    /// Declare a queue
    async fn declare_queue(&self, name: &str, durable: bool) -> MessagingResult<()>;

    /// Bind a queue to an exchange with a routing key pattern
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> MessagingResult<()>;

    /// Publish a message. Returns whether the broker accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<bool>;

    /// Start a subscription on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<Box<dyn DeliveryStream>>;

    /// Check if the channel is still open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> MessagingResult<()>;
}

impl std::fmt::Debug for dyn BrokerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerChannel").finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription.
///
/// Yields `None` once the subscription is cancelled or its connection closes.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<MessagingResult<Delivery>>;
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge message processing
    async fn ack(&self) -> MessagingResult<()>;

    /// Negative acknowledge, requeueing when asked
    async fn nack(&self, requeue: bool) -> MessagingResult<()>;
}
