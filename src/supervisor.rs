//! Process supervisor
//!
//! Owns the process lifecycle: validate configuration, serve liveness, start
//! consumers (retrying while the broker is unreachable), then wait for a
//! termination signal or a fatal error and shut the consumers down.

use crate::api::{build_liveness_router, build_metrics_router, LivenessState};
use crate::config::{Config, StartupConfig};
use crate::dispatch::{ConsumerOrchestrator, HandlerRegistry, OrchestratorStatus};
use crate::error::AppError;
use crate::handlers::{build_registry, build_store, SmtpNotifier};
use crate::messaging::{
    build_connector, metrics, BrokerConnector, ConnectionManager, MessagingError,
    MessagingResult, Topology,
};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why the supervisor gave up
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<&'static str>),

    #[error("Failed to build components: {0}")]
    Setup(#[from] AppError),

    #[error("Failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("Consumers could not start: {0}")]
    Startup(MessagingError),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Sender side of the fatal-error channel
#[derive(Clone)]
pub struct FatalHandle(mpsc::UnboundedSender<String>);

impl FatalHandle {
    /// Request shutdown with a non-zero exit
    pub fn trigger(&self, reason: impl Into<String>) {
        let _ = self.0.send(reason.into());
    }
}

/// Route otherwise-unhandled panics into the fatal channel
pub fn install_panic_hook(fatal: FatalHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "Unhandled panic");
        fatal.trigger(format!("panic: {}", info));
        previous(info);
    }));
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

pub struct Supervisor {
    config: Config,
    connector: Option<Arc<dyn BrokerConnector>>,
    registry: Option<HandlerRegistry>,
    fatal_tx: mpsc::UnboundedSender<String>,
    fatal_rx: mpsc::UnboundedReceiver<String>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector: None,
            registry: None,
            fatal_tx,
            fatal_rx,
        }
    }

    /// Use this connector instead of the configured backend
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use these handlers instead of the standard set
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fatal_handle(&self) -> FatalHandle {
        FatalHandle(self.fatal_tx.clone())
    }

    /// Run until `shutdown` resolves (`Ok`) or something fatal happens (`Err`)
    pub async fn run<F>(self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let Supervisor {
            config,
            connector,
            registry,
            fatal_tx,
            mut fatal_rx,
        } = self;
        let fatal = FatalHandle(fatal_tx);

        let missing = config.missing_required();
        if !missing.is_empty() {
            error!(missing = ?missing, "Missing required configuration");
            return Err(SupervisorError::MissingConfiguration(missing));
        }

        if config.observability.prometheus_enabled {
            if let Err(e) = metrics::init_metrics() {
                warn!(error = %e, "Failed to initialize metrics, continuing without them");
            }
        }

        let orchestrator = Arc::new(build_orchestrator(&config, connector, registry)?);

        let mut servers = Vec::new();
        let liveness = LivenessState::new(config.observability.service_name.clone())
            .with_orchestrator(orchestrator.clone());
        let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
        let listener = TcpListener::bind(&http_addr)
            .await
            .map_err(|e| SupervisorError::Bind(http_addr.clone(), e))?;
        info!(addr = %http_addr, "Liveness endpoint listening");
        servers.push(spawn_server("liveness", listener, build_liveness_router(liveness), fatal.clone()));

        if config.observability.prometheus_enabled {
            let metrics_addr = format!("{}:{}", config.server.host, config.server.metrics_port);
            match TcpListener::bind(&metrics_addr).await {
                Ok(listener) => {
                    info!(addr = %metrics_addr, "Metrics endpoint listening");
                    servers.push(spawn_server("metrics", listener, build_metrics_router(), fatal.clone()));
                }
                Err(e) => warn!(addr = %metrics_addr, error = %e, "Metrics endpoint unavailable"),
            }
        }

        tokio::pin!(shutdown);

        let started = tokio::select! {
            result = start_with_retry(&orchestrator, &config.startup) => result,
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                shutdown_all(&orchestrator, servers, None).await;
                return Ok(());
            }
            Some(reason) = fatal_rx.recv() => {
                error!(reason = %reason, "Fatal error during startup");
                shutdown_all(&orchestrator, servers, None).await;
                return Err(SupervisorError::Fatal(reason));
            }
        };

        match started {
            Ok(status) => info!(
                active_kinds = ?status.active_kinds,
                registered_kinds = ?status.registered_kinds,
                "Dispatcher running"
            ),
            Err(e) => {
                error!(error = %e, "Giving up on consumer startup");
                shutdown_all(&orchestrator, servers, None).await;
                return Err(SupervisorError::Startup(e));
            }
        }

        let watchdog = match config.startup.watchdog_interval_secs {
            0 => None,
            secs => Some(tokio::spawn(watchdog(
                orchestrator.clone(),
                Duration::from_secs(secs),
            ))),
        };

        let outcome = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                Ok(())
            }
            Some(reason) = fatal_rx.recv() => {
                error!(reason = %reason, "Fatal error, shutting down");
                Err(SupervisorError::Fatal(reason))
            }
        };

        shutdown_all(&orchestrator, servers, watchdog).await;
        outcome
    }
}

fn build_orchestrator(
    config: &Config,
    connector: Option<Arc<dyn BrokerConnector>>,
    registry: Option<HandlerRegistry>,
) -> Result<ConsumerOrchestrator, AppError> {
    let connector = match connector {
        Some(connector) => connector,
        None => build_connector(&config.broker)?,
    };
    let connection = Arc::new(ConnectionManager::new(
        connector,
        Topology::standard(config.broker.exchange.clone()),
    ));

    let registry = match registry {
        Some(registry) => registry,
        None => {
            let store = build_store(&config.store)?;
            let notifier = Arc::new(SmtpNotifier::from_config(&config.email)?);
            build_registry(store, notifier, config.email.alert_recipients.clone())
        }
    };

    Ok(ConsumerOrchestrator::new(
        connection,
        Arc::new(registry),
        config.dispatch_settings(),
    ))
}

/// Retry `start_all` while the broker is unreachable
async fn start_with_retry(
    orchestrator: &ConsumerOrchestrator,
    startup: &StartupConfig,
) -> MessagingResult<OrchestratorStatus> {
    let attempts = startup.connect_attempts.max(1);
    let backoff = Duration::from_secs(startup.connect_backoff_secs);
    let mut attempt = 1;

    loop {
        match orchestrator.start_all().await {
            Ok(status) => return Ok(status),
            Err(e) if e.is_connection_error() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Broker unavailable, retrying startup");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Restart consumers on a fresh connection whenever their session is gone,
/// including when the publisher already reconnected underneath them
async fn watchdog(orchestrator: Arc<ConsumerOrchestrator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if orchestrator.is_healthy() {
            continue;
        }

        let status = orchestrator.status();
        warn!(
            state = %status.state,
            broker_ready = status.broker_ready,
            active_kinds = ?status.active_kinds,
            "Consumer session lost, restarting consumers"
        );
        orchestrator.stop().await;
        match orchestrator.start_all().await {
            Ok(status) => info!(active_kinds = ?status.active_kinds, "Consumers restarted"),
            Err(e) => error!(error = %e, "Consumer restart failed, retrying on next check"),
        }
    }
}

fn spawn_server(name: &'static str, listener: TcpListener, router: Router, fatal: FatalHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match axum::serve(listener, router).await {
            Ok(()) => fatal.trigger(format!("{} server stopped", name)),
            Err(e) => fatal.trigger(format!("{} server failed: {}", name, e)),
        }
    })
}

async fn shutdown_all(
    orchestrator: &ConsumerOrchestrator,
    servers: Vec<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
) {
    if let Some(watchdog) = watchdog {
        watchdog.abort();
        let _ = watchdog.await;
    }
    orchestrator.stop().await;
    for server in servers {
        server.abort();
    }
    info!("Shutdown complete");
}
