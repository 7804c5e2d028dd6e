//! Broker topology: exchange, per-kind queues and their bindings

use crate::messaging::config::DEFAULT_EXCHANGE;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::events::EventKind;
use crate::messaging::traits::BrokerChannel;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Static routing configuration for one event kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyEntry {
    pub kind: EventKind,
    pub queue_name: String,
    pub routing_key: String,
    pub durable: bool,
}

impl TopologyEntry {
    pub fn new(kind: EventKind, queue_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            kind,
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
            durable: true,
        }
    }

    /// Queue holding messages that exhausted their retries
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead_letter", self.queue_name)
    }

    /// Routing key bound to the dead-letter queue
    pub fn dead_letter_routing_key(&self) -> String {
        format!("dead_letter.{}", self.routing_key)
    }
}

/// The queue and routing key every kind is published on
pub fn default_entry(kind: EventKind) -> TopologyEntry {
    let (queue, routing_key) = match kind {
        EventKind::LowStockAlert => ("inventory.low_stock_alert", "inventory.stock.low"),
        EventKind::NewCustomerRegistration => ("customers.registration", "customer.registered"),
        EventKind::NewProductCreation => ("catalog.product_creation", "catalog.product.created"),
        EventKind::NewOrderCreation => ("orders.creation", "order.created"),
        EventKind::InvoiceGeneration => ("invoices.generation", "invoice.requested"),
    };
    TopologyEntry::new(kind, queue, routing_key)
}

/// Exchange plus one entry per event kind
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    exchange: String,
    entries: BTreeMap<EventKind, TopologyEntry>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::standard(DEFAULT_EXCHANGE)
    }
}

impl Topology {
    /// Validate and build a topology. Kinds must be unique, and so must every
    /// queue and routing key including the dead-letter ones. Routing keys are
    /// literal, never wildcard patterns.
    pub fn new(exchange: impl Into<String>, entries: Vec<TopologyEntry>) -> MessagingResult<Self> {
        let exchange = exchange.into();
        if exchange.is_empty() {
            return Err(MessagingError::ConfigurationError(
                "exchange name cannot be empty".to_string(),
            ));
        }

        let mut queues = HashSet::new();
        let mut routing_keys = HashSet::new();
        let mut by_kind = BTreeMap::new();

        for entry in entries {
            // A wildcard binding would pull other kinds' events into this queue
            if entry.routing_key.split('.').any(|word| word == "*" || word == "#") {
                return Err(MessagingError::ConfigurationError(format!(
                    "routing key {} must not contain wildcards",
                    entry.routing_key
                )));
            }
            for queue in [entry.queue_name.clone(), entry.dead_letter_queue()] {
                if !queues.insert(queue.clone()) {
                    return Err(MessagingError::ConfigurationError(format!(
                        "queue {} is mapped more than once",
                        queue
                    )));
                }
            }
            for key in [entry.routing_key.clone(), entry.dead_letter_routing_key()] {
                if !routing_keys.insert(key.clone()) {
                    return Err(MessagingError::ConfigurationError(format!(
                        "routing key {} is mapped more than once",
                        key
                    )));
                }
            }
            let kind = entry.kind;
            if by_kind.insert(kind, entry).is_some() {
                return Err(MessagingError::ConfigurationError(format!(
                    "event kind {} has more than one topology entry",
                    kind
                )));
            }
        }

        Ok(Self {
            exchange,
            entries: by_kind,
        })
    }

    /// The fixed table for every kind on the given exchange
    pub fn standard(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            entries: EventKind::all()
                .into_iter()
                .map(|kind| (kind, default_entry(kind)))
                .collect(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Look up the entry for a kind
    pub fn entry(&self, kind: EventKind) -> MessagingResult<&TopologyEntry> {
        self.entries
            .get(&kind)
            .ok_or(MessagingError::UnknownEventKind(kind))
    }

    pub fn entries(&self) -> impl Iterator<Item = &TopologyEntry> {
        self.entries.values()
    }
}

/// Declares the topology on a channel
#[derive(Debug, Clone)]
pub struct TopologyManager {
    topology: Topology,
}

impl TopologyManager {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare the exchange, every queue (with its dead-letter queue) and the
    /// bindings. Safe to repeat with identical parameters; a conflicting
    /// declaration fails.
    pub async fn setup(&self, channel: &dyn BrokerChannel) -> MessagingResult<()> {
        let exchange = self.topology.exchange();

        channel
            .declare_exchange(exchange, true)
            .await
            .map_err(into_topology_error)?;
        debug!(exchange = %exchange, "Exchange declared");

        for entry in self.topology.entries() {
            let dead_letter_queue = entry.dead_letter_queue();
            let dead_letter_key = entry.dead_letter_routing_key();

            channel
                .declare_queue(&entry.queue_name, entry.durable)
                .await
                .map_err(into_topology_error)?;
            channel
                .bind_queue(&entry.queue_name, exchange, &entry.routing_key)
                .await
                .map_err(into_topology_error)?;
            channel
                .declare_queue(&dead_letter_queue, entry.durable)
                .await
                .map_err(into_topology_error)?;
            channel
                .bind_queue(&dead_letter_queue, exchange, &dead_letter_key)
                .await
                .map_err(into_topology_error)?;

            debug!(
                event_kind = %entry.kind,
                queue = %entry.queue_name,
                routing_key = %entry.routing_key,
                "Queue declared and bound"
            );
        }

        info!(
            exchange = %exchange,
            queues = self.topology.entries.len(),
            "Broker topology ready"
        );
        Ok(())
    }
}

fn into_topology_error(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Topology(_) => err,
        other => MessagingError::Topology(other.to_string()),
    }
}
