use clap::Parser;
use std::process::ExitCode;
use storefront_event_dispatcher::{
    config::Config,
    messaging::BrokerBackend,
    supervisor::{install_panic_hook, shutdown_signal, Supervisor},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "storefront-dispatcher")]
#[command(about = "Dispatch storefront domain events to their handlers", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, env = "STOREFRONT_CONFIG")]
    config: Option<String>,

    /// Override the broker connection string
    #[arg(long)]
    broker_url: Option<String>,

    /// Use the process-local broker instead of AMQP
    #[arg(long)]
    in_memory_broker: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = args.broker_url {
        config.broker.url = Some(url);
    }
    if args.in_memory_broker {
        config.broker.backend = BrokerBackend::Memory;
    }

    if let Err(e) = telemetry::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {}", e);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.broker.backend,
        "Starting storefront event dispatcher"
    );

    let supervisor = Supervisor::new(config);
    install_panic_hook(supervisor.fatal_handle());

    match supervisor.run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Dispatcher exiting");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
