//! Moovolt OCPP Node - charge point adapter fleet
//!
//! Runs one adapter per configured station against a broker node.
//!
//! # Usage
//!
//! ```bash
//! # One station
//! moovolt-ocpp-node --station CS001=ws://10.0.0.21:9000/ocpp
//!
//! # Several stations, coordinator fleet split in 4 shards
//! moovolt-ocpp-node --broker ws://broker:5673 --shards 4 \
//!     --station CS001=ws://10.0.0.21:9000/ocpp \
//!     --station CS002=ws://10.0.0.22:9000/ocpp
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use moovolt_adapter_ocpp::{Adapter, AdapterConfig, ConnectionConfig};
use moovolt_broker::{RemoteBus, RemoteBusConfig};
use moovolt_core::{Gateway, GatewayConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Moovolt charge point adapter fleet
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URL
    #[arg(long, default_value = "ws://localhost:5673")]
    broker: String,

    /// Station to drive, as ID=ENDPOINT (can be repeated)
    #[arg(long = "station", value_parser = parse_station, required = true)]
    stations: Vec<(String, String)>,

    /// Number of coordinator shards
    #[arg(long, default_value = "1")]
    shards: u32,

    /// Heartbeat interval handed to stations, in seconds
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Seconds to wait for a station to answer a command
    #[arg(long, default_value = "30")]
    command_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_station(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((id, endpoint)) if !id.is_empty() && !endpoint.is_empty() => {
            Ok((id.to_string(), endpoint.to_string()))
        }
        _ => Err(format!("expected ID=ENDPOINT, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Moovolt OCPP Node - Charge Point Adapters         ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Broker:    {:<49} ║", truncate(&args.broker, 49));
    println!("║  Stations:  {:<49} ║", args.stations.len());
    println!("║  Shards:    {:<49} ║", args.shards);
    println!("║  Heartbeat: {:<49} ║", format!("{}s", args.heartbeat_interval));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let cancel = CancellationToken::new();
    let bus = RemoteBus::connect(RemoteBusConfig::new(&args.broker), cancel.clone()).await?;
    let gateway = Gateway::new(
        Arc::new(bus),
        GatewayConfig::default().with_shard_count(args.shards),
    );

    let connection = ConnectionConfig::default()
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .with_command_timeout(Duration::from_secs(args.command_timeout_secs));

    let mut adapters = Vec::new();
    for (id, endpoint) in &args.stations {
        info!("Starting adapter for {} at {}", id, endpoint);
        let config = AdapterConfig::new(id, endpoint).with_connection(connection.clone());
        let adapter = Adapter::new(config, gateway.clone());
        let cancel = cancel.clone();
        let id = id.clone();
        adapters.push(tokio::spawn(async move {
            if let Err(e) = adapter.run(cancel).await {
                error!("Adapter {} failed: {}", id, e);
            }
        }));
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping adapters");
            shutdown.cancel();
        }
    });

    for adapter in adapters {
        let _ = adapter.await;
    }
    cancel.cancel();
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
