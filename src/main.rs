//! HashMQ - MQTT v3.1.1/v5.0 broker
//!
//! Usage:
//!   hashmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>              Configuration file path
//!   -b, --bind <ADDR>                Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>            Maximum connections (default: 100000)
//!   --max-packet-size <N>            Maximum packet size (default: 1MB)
//!   --max-pending-messages <N>       Queued messages per session (default: 1000)
//!   --overflow-strategy <STRATEGY>   drop-new-message | drop-oldest-queued-message
//!   -l, --log-level                  Log level (error, warn, info, debug, trace)
//!   -h, --help                       Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use hashmq::config::{BackendType, Config, PersistenceConfig};
use hashmq::persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};
use hashmq::session::OverflowStrategy;
use hashmq::{Broker, DefaultHooks};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// Queue overflow behaviour for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Overflow {
    /// Reject the incoming message
    DropNewMessage,
    /// Evict the oldest queued message
    DropOldestQueuedMessage,
}

impl From<Overflow> for OverflowStrategy {
    fn from(value: Overflow) -> Self {
        match value {
            Overflow::DropNewMessage => OverflowStrategy::DropNewMessage,
            Overflow::DropOldestQueuedMessage => OverflowStrategy::DropOldestQueuedMessage,
        }
    }
}

/// HashMQ - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "hashmq")]
#[command(version)]
#[command(about = "MQTT v3.1.1/v5.0 broker with hashed topic matching")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Queued application messages per session
    #[arg(long)]
    max_pending_messages: Option<usize>,

    /// What a full session queue does with the next message
    #[arg(long, value_enum)]
    overflow_strategy: Option<Overflow>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // the file is optional; env overrides apply either way
    let file_config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match file_config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        file_config
            .log
            .level
            .as_deref()
            .map(LogLevel::from_config)
            .unwrap_or_default()
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut broker_config = file_config.to_broker_config()?;
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(max) = args.max_connections {
        broker_config.max_connections = max;
    }
    if let Some(max) = args.max_packet_size {
        broker_config.max_packet_size = max;
    }
    if let Some(max) = args.max_pending_messages {
        broker_config.session.max_pending_messages = max;
    }
    if let Some(strategy) = args.overflow_strategy {
        broker_config.session.overflow_strategy = strategy.into();
    }

    info!("Starting HashMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!(
        "  Session queue: {} messages, {}",
        broker_config.session.max_pending_messages, broker_config.session.overflow_strategy
    );

    let persistence = open_persistence(&file_config.persistence)?;
    let broker = Arc::new(Broker::from_parts(
        broker_config,
        Arc::new(DefaultHooks),
        persistence,
    )?);
    broker.restore().await?;

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_broker.shutdown();
            }
            Err(e) => error!("failed to listen for Ctrl-C: {}", e),
        }
    });

    broker.run().await?;
    Ok(())
}

fn open_persistence(
    config: &PersistenceConfig,
) -> Result<Option<Arc<PersistenceManager>>, Box<dyn std::error::Error>> {
    if !config.enabled {
        info!("  Persistence: disabled");
        return Ok(None);
    }
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendType::Fjall => {
            info!("  Persistence: fjall at {}", config.path.display());
            Arc::new(FjallBackend::open(&config.path)?)
        }
        BackendType::Memory => {
            info!("  Persistence: memory");
            Arc::new(MemoryBackend::new())
        }
    };
    Ok(Some(Arc::new(PersistenceManager::new(
        backend,
        config.flush_interval,
        config.max_batch_size,
    ))))
}
