//! Event publishing and broker plumbing
//!
//! Storefront domain events travel through a single durable topic exchange.
//! Every event kind has its own durable queue bound with a fixed routing key,
//! so each published event lands in exactly one work queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish()   ┌─────────────────────┐
//! │  Publisher   │──────────────▶│  ConnectionManager  │
//! └──────────────┘               │  (one connection,   │
//!                                │   one channel)      │
//! ┌──────────────┐   consume()   │                     │
//! │ Orchestrator │──────────────▶│  TopologyManager    │
//! └──────────────┘               └──────────┬──────────┘
//!                                           │ BrokerConnector
//!                               ┌───────────┴───────────┐
//!                               ▼                       ▼
//!                     ┌──────────────────┐    ┌──────────────────┐
//!                     │  AMQP (lapin)    │    │  In-memory       │
//!                     └──────────────────┘    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storefront_event_dispatcher::messaging::{
//!     ConnectionManager, InMemoryBroker, LowStockAlert, Publisher, Topology,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = InMemoryBroker::new();
//!     let connection = Arc::new(ConnectionManager::new(Arc::new(broker), Topology::default()));
//!     let publisher = Publisher::new(connection);
//!
//!     publisher
//!         .publish_event(LowStockAlert {
//!             product_id: "P-1".to_string(),
//!             product_name: "Desk lamp".to_string(),
//!             sku: None,
//!             current_stock: 2,
//!             threshold: 10,
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod amqp;
mod config;
mod connection;
mod error;
mod events;
mod memory;
mod message;
pub mod metrics;
mod publisher;
mod topology;
mod traits;

pub use amqp::AmqpConnector;
pub use config::{BrokerBackend, BrokerConfig, DEFAULT_EXCHANGE};
pub use connection::ConnectionManager;
pub use error::{MessagingError, MessagingResult};
pub use events::{
    DomainEvent, EventEnvelope, EventKind, EventPayload, InvoiceGeneration, LowStockAlert,
    NewCustomerRegistration, NewOrderCreation, NewProductCreation, OrderLine, OrderSnapshot,
};
pub use memory::{topic_matches, BrokerStats, InMemoryBroker};
pub use message::{Delivery, OutboundMessage, ATTEMPT_HEADER, CONTENT_TYPE_JSON};
pub use publisher::Publisher;
pub use topology::{default_entry, Topology, TopologyEntry, TopologyManager};
pub use traits::{Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream};

use std::sync::Arc;

/// Build the connector for the configured backend
pub fn build_connector(config: &BrokerConfig) -> MessagingResult<Arc<dyn BrokerConnector>> {
    match config.backend {
        BrokerBackend::Amqp => Ok(Arc::new(AmqpConnector::new(config)?)),
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::new())),
    }
}
