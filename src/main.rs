//! robridge - ROS 2 <-> MQTT topic bridging daemon
//!
//! Usage:
//!   robridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --host <HOST>          Broker host (overrides config)
//!   --port <PORT>          Broker port (overrides config)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use robridge::bus::LocalBus;
use robridge::config::Config;
use robridge::schema::SchemaRegistry;
use robridge::BridgeManager;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
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

    fn from_config(level: &str) -> Level {
        match level {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// robridge - ROS 2 <-> MQTT topic bridge
#[derive(Parser, Debug)]
#[command(name = "robridge")]
#[command(version)]
#[command(about = "Bridges topics between a robotics bus and an MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Broker port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides config)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }

    let level = args
        .log_level
        .map(LogLevel::to_tracing_level)
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        "robridge {} starting: broker {}, {} bridges configured",
        env!("CARGO_PKG_VERSION"),
        config.broker.address(),
        config.bridge.len()
    );
    if config.bridge.is_empty() {
        warn!("no bridges configured; only heartbeat and transfers will run");
    }

    // The bus adapter is a deployment concern; the loopback bus keeps the
    // daemon runnable without a bus backend compiled in.
    let bus = Arc::new(LocalBus::new());
    let registry = SchemaRegistry::with_defaults();
    let manager = BridgeManager::new(config, bus, &registry)?;
    manager.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    manager.shutdown().await;

    Ok(())
}
