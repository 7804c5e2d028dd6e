//! Consumer orchestrator: one subscription per registered event kind

use crate::dispatch::consumer::{process_delivery, SubscriptionContext};
use crate::dispatch::handler::HandlerRegistry;
use crate::dispatch::DispatchSettings;
use crate::messaging::metrics::ACTIVE_CONSUMERS;
use crate::messaging::{ConnectionManager, DeliveryStream, EventKind, MessagingResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub state: OrchestratorState,
    pub running: bool,
    pub active_kinds: Vec<EventKind>,
    pub registered_kinds: Vec<EventKind>,
    pub broker_ready: bool,
}

struct Subscription {
    kind: EventKind,
    handle: JoinHandle<()>,
}

type ActiveKinds = Arc<RwLock<BTreeSet<EventKind>>>;

/// Starts and stops every subscription as a unit
pub struct ConsumerOrchestrator {
    connection: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    settings: DispatchSettings,
    state: RwLock<OrchestratorState>,
    active: ActiveKinds,
    /// Session and kinds the current subscriptions were started with
    started: RwLock<Option<(u64, BTreeSet<EventKind>)>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ConsumerOrchestrator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<HandlerRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            connection,
            registry,
            settings,
            state: RwLock::new(OrchestratorState::Idle),
            active: Arc::new(RwLock::new(BTreeSet::new())),
            started: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == OrchestratorState::Running
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Running, on the session the subscriptions were started on, with every
    /// started subscription still alive
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let started = self.started.read();
        let Some((session, kinds)) = started.as_ref() else {
            return false;
        };
        self.connection.session_id() == Some(*session) && *self.active.read() == *kinds
    }

    pub fn status(&self) -> OrchestratorStatus {
        let state = self.state();
        OrchestratorStatus {
            state,
            running: state == OrchestratorState::Running,
            active_kinds: self.active.read().iter().copied().collect(),
            registered_kinds: self.registry.registered_kinds(),
            broker_ready: self.connection.is_ready(),
        }
    }

    /// Connect, declare topology and subscribe every registered kind.
    ///
    /// A no-op while running. Connection and topology failures are returned;
    /// a subscription that fails to start is logged and skipped.
    pub async fn start_all(&self) -> MessagingResult<OrchestratorStatus> {
        let mut subscriptions = self.subscriptions.lock().await;
        if self.state() == OrchestratorState::Running {
            debug!("Consumers already running");
            return Ok(self.status());
        }

        self.set_state(OrchestratorState::Starting);

        let channel = match self.connection.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to start consumers");
                self.set_state(OrchestratorState::Idle);
                return Err(e);
            }
        };

        let topology = self.connection.topology();
        for kind in self.registry.registered_kinds() {
            let entry = match topology.entry(kind) {
                Ok(entry) => entry.clone(),
                Err(e) => {
                    error!(event_kind = %kind, error = %e, "No queue for registered handler, skipping");
                    continue;
                }
            };

            let consumer_tag = format!(
                "{}.{}.{}",
                self.settings.consumer_tag_prefix,
                entry.queue_name,
                Uuid::new_v4().simple()
            );

            let stream = match channel.consume(&entry.queue_name, &consumer_tag).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        event_kind = %kind,
                        queue = %entry.queue_name,
                        error = %e,
                        "Failed to start consumer, continuing with the rest"
                    );
                    continue;
                }
            };

            info!(
                event_kind = %kind,
                queue = %entry.queue_name,
                consumer_tag = %consumer_tag,
                "Consumer started"
            );

            self.active.write().insert(kind);
            let ctx = SubscriptionContext {
                kind,
                exchange: topology.exchange().to_string(),
                entry,
                channel: channel.clone(),
                registry: self.registry.clone(),
                settings: self.settings.clone(),
            };
            let handle = tokio::spawn(run_subscription(ctx, stream, self.active.clone()));
            subscriptions.push(Subscription { kind, handle });
        }

        let session = self.connection.session_id().unwrap_or_default();
        let kinds: BTreeSet<EventKind> = subscriptions.iter().map(|s| s.kind).collect();
        *self.started.write() = Some((session, kinds));

        let active = self.active.read().len();
        ACTIVE_CONSUMERS.set(active as f64);
        if active == 0 && !self.registry.registered_kinds().is_empty() {
            warn!("No consumers could be started");
        }

        self.set_state(OrchestratorState::Running);
        info!(active_consumers = active, "Consumer orchestrator running");
        Ok(self.status())
    }

    /// Close the broker connection and wait for every subscription to end.
    ///
    /// Unacknowledged deliveries return to their queues when the connection
    /// closes.
    pub async fn stop(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        self.set_state(OrchestratorState::Stopping);
        info!(subscriptions = subscriptions.len(), "Stopping consumers");

        self.connection.close().await;

        for subscription in subscriptions.drain(..) {
            subscription.handle.abort();
            match subscription.handle.await {
                Err(e) if e.is_panic() => {
                    error!(event_kind = %subscription.kind, "Subscription task panicked")
                }
                _ => debug!(event_kind = %subscription.kind, "Subscription task finished"),
            }
        }

        self.active.write().clear();
        *self.started.write() = None;
        ACTIVE_CONSUMERS.set(0.0);
        self.set_state(OrchestratorState::Idle);
        info!("Consumers stopped");
    }

    fn set_state(&self, state: OrchestratorState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "Orchestrator state changed");
        }
    }
}

/// Removes a kind from the active set when its task ends, however it ends
struct ActiveGuard {
    kind: EventKind,
    active: ActiveKinds,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.active.write();
        active.remove(&self.kind);
        ACTIVE_CONSUMERS.set(active.len() as f64);
    }
}

async fn run_subscription(ctx: SubscriptionContext, mut stream: Box<dyn DeliveryStream>, active: ActiveKinds) {
    let _guard = ActiveGuard {
        kind: ctx.kind,
        active,
    };

    while let Some(next) = stream.next().await {
        match next {
            Ok(delivery) => {
                let tag = delivery.delivery_tag;
                let disposition = process_delivery(&ctx, delivery).await;
                debug!(
                    event_kind = %ctx.kind,
                    delivery_tag = tag,
                    disposition = disposition.as_str(),
                    "Delivery settled"
                );
            }
            Err(e) => {
                error!(event_kind = %ctx.kind, queue = %ctx.entry.queue_name, error = %e, "Subscription failed");
                break;
            }
        }
    }

    info!(event_kind = %ctx.kind, queue = %ctx.entry.queue_name, "Subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::{EventContext, EventHandler, HandlerResult};
    use crate::messaging::{
        default_entry, BrokerChannel, InMemoryBroker, LowStockAlert, NewOrderCreation, Publisher,
        Topology, DEFAULT_EXCHANGE,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl EventHandler<LowStockAlert> for Forward {
        async fn handle(&self, _ctx: &EventContext, event: &LowStockAlert) -> HandlerResult {
            let _ = self.0.send(event.product_id.clone());
            Ok(())
        }
    }

    struct Ignore;

    #[async_trait]
    impl EventHandler<NewOrderCreation> for Ignore {
        async fn handle(&self, _ctx: &EventContext, _event: &NewOrderCreation) -> HandlerResult {
            Ok(())
        }
    }

    fn setup(broker: &InMemoryBroker) -> (ConsumerOrchestrator, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new()
            .on_low_stock_alert(Forward(tx))
            .on_new_order_creation(Ignore);
        let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), Topology::default()));
        let orchestrator = ConsumerOrchestrator::new(connection, Arc::new(registry), DispatchSettings::default());
        (orchestrator, rx)
    }

    #[tokio::test]
    async fn test_start_all_subscribes_registered_kinds() {
        let broker = InMemoryBroker::new();
        let (orchestrator, _rx) = setup(&broker);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);

        let status = orchestrator.start_all().await.unwrap();
        assert!(status.running);
        assert!(status.broker_ready);
        assert_eq!(
            status.active_kinds,
            vec![EventKind::LowStockAlert, EventKind::NewOrderCreation]
        );
        assert_eq!(broker.consumer_count("inventory.low_stock_alert"), 1);
        assert_eq!(broker.consumer_count("customers.registration"), 0);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_start_all_is_idempotent() {
        let broker = InMemoryBroker::new();
        let (orchestrator, _rx) = setup(&broker);

        orchestrator.start_all().await.unwrap();
        orchestrator.start_all().await.unwrap();
        assert_eq!(broker.consumer_count("inventory.low_stock_alert"), 1);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_delivers_published_events() {
        let broker = InMemoryBroker::new();
        let (orchestrator, mut rx) = setup(&broker);
        orchestrator.start_all().await.unwrap();

        let publisher = Publisher::new(orchestrator.connection().clone());
        publisher
            .publish_event(LowStockAlert {
                product_id: "P-7".to_string(),
                product_name: "Chair".to_string(),
                sku: None,
                current_stock: 0,
                threshold: 2,
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "P-7");

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_returns_to_idle() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let (orchestrator, _rx) = setup(&broker);

        assert!(orchestrator.start_all().await.is_err());
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert!(orchestrator.status().active_kinds.is_empty());
    }

    #[tokio::test]
    async fn test_stop_then_restart() {
        let broker = InMemoryBroker::new();
        let (orchestrator, _rx) = setup(&broker);

        orchestrator.start_all().await.unwrap();
        orchestrator.stop().await;

        let status = orchestrator.status();
        assert_eq!(status.state, OrchestratorState::Idle);
        assert!(!status.broker_ready);
        assert!(status.active_kinds.is_empty());
        assert_eq!(broker.consumer_count("inventory.low_stock_alert"), 0);

        let status = orchestrator.start_all().await.unwrap();
        assert!(status.running);
        assert_eq!(broker.consumer_count("inventory.low_stock_alert"), 1);

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_kind_without_queue_is_skipped() {
        let broker = InMemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new()
            .on_low_stock_alert(Forward(tx))
            .on_new_order_creation(Ignore);
        let topology = Topology::new(
            DEFAULT_EXCHANGE,
            vec![default_entry(EventKind::NewOrderCreation)],
        )
        .unwrap();
        let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), topology));
        let orchestrator = ConsumerOrchestrator::new(connection, Arc::new(registry), DispatchSettings::default());

        let status = orchestrator.start_all().await.unwrap();

        assert_eq!(status.state, OrchestratorState::Running);
        assert_eq!(status.active_kinds, vec![EventKind::NewOrderCreation]);
        assert_eq!(
            status.registered_kinds,
            vec![EventKind::LowStockAlert, EventKind::NewOrderCreation]
        );
        assert_eq!(broker.consumer_count("orders.creation"), 1);
        // A kind that never started does not count against health
        assert!(orchestrator.is_healthy());

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_unhealthy_after_session_replaced() {
        let broker = InMemoryBroker::new();
        let (orchestrator, _rx) = setup(&broker);
        assert!(!orchestrator.is_healthy());

        orchestrator.start_all().await.unwrap();
        assert!(orchestrator.is_healthy());

        orchestrator.connection().channel().unwrap().close().await.unwrap();
        // A publish reconnects the shared manager on a fresh session
        orchestrator.connection().connect().await.unwrap();

        assert!(orchestrator.is_running());
        assert!(orchestrator.connection().is_ready());
        assert!(!orchestrator.is_healthy());

        orchestrator.stop().await;
        assert!(!orchestrator.is_healthy());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&OrchestratorState::Running).unwrap(), "\"running\"");
        assert_eq!(OrchestratorState::Stopping.to_string(), "stopping");
    }
}
