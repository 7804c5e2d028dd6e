use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use storefront_event_dispatcher::{
    config::Config,
    messaging::{build_connector, ConnectionManager, EventEnvelope, EventKind, Publisher, Topology},
};

#[derive(Parser)]
#[command(name = "storefront-events-cli")]
#[command(about = "Operator tooling for the storefront event exchange", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, env = "STOREFRONT_CONFIG", global = true)]
    config: Option<String>,

    /// Override the broker connection string
    #[arg(long, global = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one event
    Publish {
        /// Event kind, e.g. LowStockAlert
        #[arg(short, long)]
        kind: EventKind,

        /// JSON payload, or @path to read it from a file
        #[arg(short, long)]
        payload: String,
    },

    /// Declare the exchange, queues and bindings, then exit
    Declare,

    /// Print the queue and routing key table
    Topology {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.broker_url {
        config.broker.url = Some(url);
    }
    let topology = Topology::standard(config.broker.exchange.clone());

    match cli.command {
        Commands::Topology { json } => {
            if json {
                let rows: Vec<_> = topology
                    .entries()
                    .map(|entry| {
                        json!({
                            "kind": entry.kind,
                            "queue": entry.queue_name,
                            "routing_key": entry.routing_key,
                            "durable": entry.durable,
                            "dead_letter_queue": entry.dead_letter_queue(),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "exchange": topology.exchange(),
                        "entries": rows,
                    }))?
                );
            } else {
                println!("exchange: {}", topology.exchange());
                println!("{:<26} {:<30} {}", "KIND", "QUEUE", "ROUTING KEY");
                for entry in topology.entries() {
                    println!("{:<26} {:<30} {}", entry.kind, entry.queue_name, entry.routing_key);
                }
            }
        }

        Commands::Declare => {
            let connection = connect(&config, topology)?;
            connection.connect().await.context("failed to declare topology")?;
            println!("Topology declared on {}", connection.topology().exchange());
            connection.close().await;
        }

        Commands::Publish { kind, payload } => {
            let raw = match payload.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read payload file {}", path))?,
                None => payload,
            };
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("payload is not valid JSON")?;
            let envelope = EventEnvelope::from_json_payload(kind, value)
                .with_context(|| format!("payload does not match {}", kind))?;

            let connection = Arc::new(connect(&config, topology)?);
            let publisher = Publisher::new(connection.clone());
            let accepted = publisher.publish(&envelope).await;
            connection.close().await;

            if !accepted.context("publish failed")? {
                bail!("broker declined event {}", envelope.id);
            }
            println!("{}", json!({ "id": envelope.id, "kind": kind }));
        }
    }

    Ok(())
}

fn connect(config: &Config, topology: Topology) -> anyhow::Result<ConnectionManager> {
    let connector = build_connector(&config.broker).context("invalid broker configuration")?;
    Ok(ConnectionManager::new(connector, topology))
}
