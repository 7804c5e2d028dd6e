//! Process-local broker with topic-exchange semantics.
//!
//! Mirrors the parts of AMQP the dispatcher relies on: durable declarations
//! that must match on redeclare, topic routing with `*` and `#`, manual
//! acknowledgement, requeue on nack and on channel or connection close.

use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message::{Delivery, OutboundMessage};
use crate::messaging::traits::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Counters describing what the broker has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Owner {
    connection: u64,
    channel: u64,
}

#[derive(Clone)]
struct StoredMessage {
    message: OutboundMessage,
    redelivered: bool,
}

struct ConsumerSlot {
    owner: Owner,
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct Unacked {
    owner: Owner,
    queue: String,
    message: StoredMessage,
}

struct BrokerState {
    reachable: bool,
    next_id: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: BTreeMap<u64, Unacked>,
    stats: BrokerStats,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                next_id: 0,
                next_delivery_tag: 0,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                unacked: BTreeMap::new(),
                stats: BrokerStats::default(),
            })),
        }
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    /// Messages waiting in a queue, not yet delivered
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Copies of the messages waiting in a queue
    pub fn peek(&self, queue: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Delivered but not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    fn declare_exchange(&self, name: &str, durable: bool) -> MessagingResult<()> {
        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != durable => Err(MessagingError::Topology(format!(
                "PRECONDITION_FAILED: exchange {} already declared with durable={}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), durable);
                Ok(())
            }
        }
    }

    fn declare_queue(&self, name: &str, durable: bool) -> MessagingResult<()> {
        let mut state = self.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(MessagingError::Topology(format!(
                "PRECONDITION_FAILED: queue {} already declared with durable={}",
                name, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Topology(format!("NOT_FOUND: exchange {}", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Topology(format!("NOT_FOUND: queue {}", queue)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> MessagingResult<bool> {
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::PublishFailed(format!(
                "NOT_FOUND: exchange {}",
                exchange
            )));
        }

        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        state.stats.published += 1;
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(StoredMessage {
                    message: message.clone(),
                    redelivered: false,
                });
            }
        }
        for queue in &targets {
            self.pump(&mut state, queue);
        }
        Ok(true)
    }

    fn consume(&self, owner: Owner, queue: &str, tag: &str) -> MessagingResult<MemoryDeliveryStream> {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(ConsumerSlot {
                owner,
                tag: tag.to_string(),
                tx,
            }),
            None => {
                return Err(MessagingError::SubscribeFailed(format!("NOT_FOUND: queue {}", queue)));
            }
        }
        self.pump(&mut state, queue);
        Ok(MemoryDeliveryStream { rx, open: None })
    }

    /// Push ready messages to consumers, round robin
    fn pump(&self, state: &mut BrokerState, queue: &str) {
        loop {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            if q.consumers.is_empty() || q.ready.is_empty() {
                return;
            }
            let index = q.cursor % q.consumers.len();
            q.cursor = q.cursor.wrapping_add(1);
            let Some(stored) = q.ready.pop_front() else {
                return;
            };
            let owner = q.consumers[index].owner;

            state.next_delivery_tag += 1;
            let tag = state.next_delivery_tag;

            let mut delivery = Delivery::new(
                stored.message.body.clone(),
                tag,
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    delivery_tag: tag,
                }),
            );
            delivery.message_id = Some(stored.message.message_id.clone());
            delivery.timestamp = Some(stored.message.timestamp);
            delivery.event_type = Some(stored.message.event_type.clone());
            delivery.redelivered = stored.redelivered;
            delivery.attempt = stored.message.attempt;

            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            if q.consumers[index].tx.send(delivery).is_err() {
                let slot = q.consumers.remove(index);
                debug!(queue = %queue, consumer_tag = %slot.tag, "Consumer gone, removed");
                q.ready.push_front(stored);
                continue;
            }

            state.stats.delivered += 1;
            state.unacked.insert(
                tag,
                Unacked {
                    owner,
                    queue: queue.to_string(),
                    message: stored,
                },
            );
        }
    }

    fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> MessagingResult<()> {
        let mut state = self.state.lock();
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(MessagingError::AckFailed(format!(
                "PRECONDITION_FAILED: unknown delivery tag {}",
                delivery_tag
            )));
        };

        match requeue {
            None => state.stats.acked += 1,
            Some(false) => state.stats.rejected += 1,
            Some(true) => {
                state.stats.requeued += 1;
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
                self.pump(&mut state, &unacked.queue);
            }
        }
        Ok(())
    }

    /// Cancel consumers and requeue unacked deliveries owned by matching channels
    fn release(&self, owned: impl Fn(&Owner) -> bool) {
        let mut state = self.state.lock();

        for q in state.queues.values_mut() {
            q.consumers.retain(|slot| !owned(&slot.owner));
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| owned(&u.owner))
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = HashSet::new();
        // Newest first so push_front restores delivery order
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
                touched.insert(unacked.queue);
            }
        }

        for queue in touched {
            self.pump(&mut state, &queue);
        }
    }
}

/// Topic pattern match: `*` is exactly one word, `#` is zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerConnection>> {
        let id = {
            let mut state = self.state.lock();
            if !state.reachable {
                return Err(MessagingError::ConnectionFailed(
                    "in-memory broker is unreachable".to_string(),
                ));
            }
            state.next_id()
        };

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(MessagingError::Channel("connection is closed".to_string()));
        }
        let channel = self.broker.state.lock().next_id();
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            owner: Owner {
                connection: self.id,
                channel,
            },
            open: Arc::new(AtomicBool::new(true)),
            connection_open: self.open.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let connection = self.id;
            self.broker.release(|owner| owner.connection == connection);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    owner: Owner,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> MessagingResult<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, durable)
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> MessagingResult<()> {
        self.ensure_open()?;
        self.broker.declare_queue(name, durable)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> MessagingResult<()> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<bool> {
        self.ensure_open()?;
        self.broker.publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<Box<dyn DeliveryStream>> {
        self.ensure_open()?;
        let mut stream = self.broker.consume(self.owner, queue, consumer_tag)?;
        stream.open = Some((self.open.clone(), self.connection_open.clone()));
        Ok(Box::new(stream))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let owner = self.owner;
            self.broker.release(|o| *o == owner);
        }
        Ok(())
    }
}

struct MemoryDeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
    open: Option<(Arc<AtomicBool>, Arc<AtomicBool>)>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<MessagingResult<Delivery>> {
        let delivery = self.rx.recv().await?;
        // Anything still buffered after close has already been requeued
        if let Some((channel, connection)) = &self.open {
            if !channel.load(Ordering::SeqCst) || !connection.load(Ordering::SeqCst) {
                return None;
            }
        }
        Some(Ok(delivery))
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.broker.settle(self.delivery_tag, None)
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.broker.settle(self.delivery_tag, Some(requeue))
    }
}
