//! fleetlink gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: device port 8833, 10k connections, info logging
//! fleetlink-server
//!
//! # Tighter fleet policy
//! fleetlink-server --bind 0.0.0.0:8833 --max-connections 2000 --log-level debug
//! ```

use std::{sync::Arc, time::Duration};

use clap::Parser;
use fleetlink_server::{Gateway, GatewayConfig, LogSink};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Teltonika protocol gateway
#[derive(Parser, Debug)]
#[command(name = "fleetlink-server")]
#[command(about = "TCP gateway for Teltonika Codec 8/8E/12 device fleets")]
#[command(version)]
struct Args {
    /// Address to bind the device-facing port to
    #[arg(short, long, default_value = "0.0.0.0:8833")]
    bind: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Maximum in-flight commands per device
    #[arg(long, default_value = "8")]
    max_in_flight: usize,

    /// Seconds a connection may take to present its identity
    #[arg(long, default_value = "30")]
    handshake_timeout: u64,

    /// Seconds a streaming session may stay silent
    #[arg(long, default_value = "600")]
    idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("fleetlink gateway starting");
    tracing::info!(bind = %args.bind, "binding device port");

    let config = GatewayConfig {
        bind_address: args.bind,
        max_connections: args.max_connections,
        max_in_flight: args.max_in_flight,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..GatewayConfig::default()
    };

    let gateway = Gateway::bind(config, Arc::new(LogSink)).await?;
    tracing::info!(addr = %gateway.local_addr()?, "gateway listening");

    let stop = gateway.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            stop.shutdown();
        }
    });

    gateway.run().await?;

    tracing::info!("gateway stopped");
    Ok(())
}
