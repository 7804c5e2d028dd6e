//! Broker connection lifecycle

use crate::messaging::error::MessagingResult;
use crate::messaging::metrics::BROKER_CONNECTED;
use crate::messaging::topology::{Topology, TopologyManager};
use crate::messaging::traits::{BrokerChannel, BrokerConnection, BrokerConnector};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct Session {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    fn is_ready(&self) -> bool {
        self.connection.is_connected() && self.channel.is_open()
    }
}

/// Owns the single broker connection and channel of the process.
///
/// The session is created lazily, topology is declared on every new session
/// before it is handed out, and a dead session is replaced, never reused.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyManager,
    session: RwLock<Option<Session>>,
    lifecycle: Mutex<()>,
    sessions_opened: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology) -> Self {
        Self {
            connector,
            topology: TopologyManager::new(topology),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
            sessions_opened: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        self.topology.topology()
    }

    /// Connect if not already connected and return the channel.
    ///
    /// Errors propagate to the caller; there is no retry here.
    pub async fn connect(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let _guard = self.lifecycle.lock().await;
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let stale = self.session.write().take();
        if let Some(stale) = stale {
            warn!("Broker session lost, discarding it before reconnecting");
            close_session(stale).await;
            BROKER_CONNECTED.set(0.0);
        }

        info!("Connecting to broker");
        let connection: Arc<dyn BrokerConnection> = Arc::from(self.connector.connect().await?);

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to open broker channel");
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Closing half-open connection failed");
                }
                return Err(e);
            }
        };

        let session = Session {
            id: self.sessions_opened.fetch_add(1, Ordering::Relaxed) + 1,
            connection,
            channel: channel.clone(),
        };

        if let Err(e) = self.topology.setup(channel.as_ref()).await {
            error!(error = %e, "Broker topology setup failed");
            close_session(session).await;
            return Err(e);
        }

        *self.session.write() = Some(session);
        BROKER_CONNECTED.set(1.0);
        info!("Broker connection established");
        Ok(channel)
    }

    /// Whether a live connection and channel exist
    pub fn is_ready(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map(Session::is_ready)
            .unwrap_or(false)
    }

    /// Identifies the live session; changes every time a new one is opened
    pub fn session_id(&self) -> Option<u64> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.is_ready())
            .map(|session| session.id)
    }

    /// The current channel, if the session is live
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.is_ready())
            .map(|session| session.channel.clone())
    }

    /// Close channel then connection. Errors are logged, never returned.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        let session = self.session.write().take();
        match session {
            Some(session) => {
                close_session(session).await;
                info!("Broker connection closed");
            }
            None => debug!("Close requested without an open broker session"),
        }
        BROKER_CONNECTED.set(0.0);
    }
}

async fn close_session(session: Session) {
    if let Err(e) = session.channel.close().await {
        warn!(error = %e, "Error closing broker channel");
    }
    if let Err(e) = session.connection.close().await {
        warn!(error = %e, "Error closing broker connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), Topology::default())
    }

    #[tokio::test]
    async fn test_connect_declares_topology() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        assert!(!manager.is_ready());
        manager.connect().await.unwrap();
        assert!(manager.is_ready());
        assert_eq!(broker.queue_names().len(), 10);
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_close_resets_state() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let first = manager.connect().await.unwrap();
        manager.close().await;
        assert!(!manager.is_ready());
        assert!(!first.is_open());

        let second = manager.connect().await.unwrap();
        assert!(manager.is_ready());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_replaced_session_gets_new_id() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        assert_eq!(manager.session_id(), None);

        let channel = manager.connect().await.unwrap();
        let first = manager.session_id().unwrap();
        manager.connect().await.unwrap();
        assert_eq!(manager.session_id(), Some(first));

        channel.close().await.unwrap();
        assert_eq!(manager.session_id(), None);

        manager.connect().await.unwrap();
        assert_ne!(manager.session_id().unwrap(), first);
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.close().await;
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);

        let err = manager.connect().await.err().unwrap();
        assert!(err.is_connection_error());
        assert!(!manager.is_ready());
    }
}
