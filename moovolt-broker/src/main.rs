//! Moovolt Broker - message bus node
//!
//! Hosts the session bus for adapter and coordinator nodes.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! moovolt-broker
//!
//! # Custom address, fewer redeliveries before dead-lettering
//! moovolt-broker --listen 127.0.0.1:6000 --max-redeliveries 5
//! ```

use std::net::SocketAddr;

use clap::Parser;
use moovolt_broker::{Broker, BrokerConfig};
use moovolt_core::bus::BusConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Moovolt session bus broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5673")]
    listen: SocketAddr,

    /// Redeliveries before a message is dead-lettered
    #[arg(long, default_value = "16")]
    max_redeliveries: u32,

    /// Messages retained per topic while no consumer group exists
    #[arg(long, default_value = "1024")]
    retain_capacity: usize,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                Moovolt Broker - Session Bus                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:           {:<42} ║", args.listen.to_string());
    println!("║  Max redeliveries: {:<42} ║", args.max_redeliveries);
    println!("║  Retain capacity:  {:<42} ║", args.retain_capacity);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = BrokerConfig::default().with_listen(args.listen).with_bus(
        BusConfig::default()
            .with_max_redeliveries(args.max_redeliveries)
            .with_retain_capacity(args.retain_capacity),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping broker");
            shutdown.cancel();
        }
    });

    Broker::new(config).run(cancel).await?;
    Ok(())
}
