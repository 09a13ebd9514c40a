//! mqttbus command line entry point

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mqttbus::config::{BusConfig, StoreBackend};
use mqttbus::observability::init_default_logging;
use mqttbus::store::{DocumentStore, EventStatus};
use mqttbus::{CallbackError, DurableOutbox, MessageBus};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mqttbus")]
#[command(about = "Resilient MQTT publish/subscribe bus with a durable outbox")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTTBUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bus until SIGINT/SIGTERM, logging messages on the given patterns
    Run {
        /// Topic pattern to subscribe to (repeatable)
        #[arg(short, long = "subscribe", value_name = "PATTERN")]
        subscribe: Vec<String>,
    },
    /// Record and publish a single message
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        payload: String,
        /// How long to wait for the broker before leaving the event for replay
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,
    },
    /// List recorded events
    Events {
        /// Only events with this status (pending, sent, failed)
        #[arg(long)]
        status: Option<EventStatus>,
        /// Only events created at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { subscribe } => run_bus(config, subscribe).await,
        Commands::Publish {
            topic,
            payload,
            wait_ms,
        } => publish_once(config, &topic, payload, Duration::from_millis(wait_ms)).await,
        Commands::Events { status, since } => list_events(config, status, since).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<BusConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusConfig::load_from_file(path)?);
    }

    for candidate in ["mqttbus.toml", "config/mqttbus.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create mqttbus.toml".into())
}

async fn run_bus(config: BusConfig, patterns: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        client_id = %config.client.id,
        name = %config.display_name(),
        "Starting mqttbus v{}",
        env!("CARGO_PKG_VERSION")
    );

    let bus = MessageBus::from_config(&config).await?;

    for pattern in &patterns {
        bus.subscribe_fn(pattern, |topic, payload| async move {
            info!(
                topic = %topic,
                bytes = payload.len(),
                payload = %String::from_utf8_lossy(&payload),
                "Message received"
            );
            Ok::<(), CallbackError>(())
        })
        .await?;
    }

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(bus.health_server(config.client.id.clone(), health_port));
    let health_task = tokio::spawn(health_server.start());

    bus.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(patterns = patterns.len(), "Bus running");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    bus.stop().await;
    health_task.abort();

    let backlog = bus.outbox().backlog().await?;
    if backlog > 0 {
        warn!(backlog, "Stopping with undelivered events; they will be replayed on next start");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn publish_once(
    config: BusConfig,
    topic: &str,
    payload: String,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.store.backend == StoreBackend::Memory {
        warn!("Memory store configured; an undelivered event will not survive this process");
    }

    let bus = MessageBus::from_config(&config).await?;
    bus.start().await?;
    if !bus.wait_until_connected(wait).await {
        warn!(waited_ms = wait.as_millis() as u64, "Broker not reachable, recording event for replay");
    }

    let id = bus.publish(topic, payload).await?;
    let status = bus
        .outbox()
        .get(id)
        .await?
        .map(|record| record.status)
        .unwrap_or(EventStatus::Pending);
    bus.stop().await;

    println!("{id} {status}");
    Ok(())
}

async fn list_events(
    config: BusConfig,
    status: Option<EventStatus>,
    since: Option<DateTime<Utc>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = match (config.store.backend, &config.store.path) {
        (StoreBackend::Document, Some(path)) => path.clone(),
        _ => return Err("`events` needs the document store backend".into()),
    };

    let outbox = DurableOutbox::new(Arc::new(DocumentStore::open(&path).await?));
    let records = outbox
        .replay_candidates(since, status.map(|s| vec![s]))
        .await?;

    for record in &records {
        println!("{}", serde_json::to_string(&EventLine::from(record))?);
    }
    info!(count = records.len(), path = %path.display(), "Listed events");
    Ok(())
}

fn handle_config_command(config: BusConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// One line of `events` output; the payload is shown as text
#[derive(serde::Serialize)]
struct EventLine<'a> {
    id: String,
    status: EventStatus,
    attempts: u32,
    created_at: DateTime<Utc>,
    topic: &'a str,
    payload: String,
}

impl<'a> From<&'a mqttbus::EventRecord> for EventLine<'a> {
    fn from(record: &'a mqttbus::EventRecord) -> Self {
        Self {
            id: record.id.to_string(),
            status: record.status,
            attempts: record.attempts,
            created_at: record.created_at,
            topic: &record.topic,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        }
    }
}
