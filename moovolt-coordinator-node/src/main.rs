//! Moovolt Coordinator Node - session coordinator shard
//!
//! Consumes station events for one shard, drives the session lifecycle and
//! archives finished sessions.
//!
//! # Usage
//!
//! ```bash
//! # Single shard with a customer table
//! moovolt-coordinator-node --profiles customers.json --tariff-cents 40
//!
//! # Shard 2 of 4
//! moovolt-coordinator-node --broker ws://broker:5673 --shard 2 --shards 4
//! ```
//!
//! Console commands: `stop <station>`, `sessions`, `quit`.
//! The same queries are served over HTTP, see [`http`].

mod http;

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use moovolt_broker::{RemoteBus, RemoteBusConfig};
use moovolt_core::{
    ArchiveConfig, ChargePointId, Coordinator, CoordinatorConfig, CoordinatorHandle, FileArchive, Gateway,
    GatewayConfig, SessionArchive, StaticAuthorization,
};
use moovolt_core::coordinator::CoordinatorError;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Time granted to in-flight session work after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Moovolt session coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URL
    #[arg(long, default_value = "ws://localhost:5673")]
    broker: String,

    /// Shard this node owns
    #[arg(long, default_value = "0")]
    shard: u32,

    /// Number of coordinator shards
    #[arg(long, default_value = "1")]
    shards: u32,

    /// Customer profiles (JSON array)
    #[arg(long)]
    profiles: Option<PathBuf>,

    /// Flat tariff in cents per kWh
    #[arg(long, default_value = "40")]
    tariff_cents: u64,

    /// HTTP listen address for session queries
    #[arg(long, default_value = "0.0.0.0:3000")]
    http: SocketAddr,

    /// Directory for the session archive
    #[arg(long, default_value = "./moovolt-data")]
    archive_dir: PathBuf,

    /// Seconds to wait for an authorization decision
    #[arg(long, default_value = "30")]
    auth_timeout_secs: u64,

    /// Seconds of station silence before a charging session is closed
    #[arg(long, default_value = "300")]
    heartbeat_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

enum ConsoleCommand {
    Stop(ChargePointId),
    Sessions,
    Quit,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           Moovolt Coordinator Node - Session Shard           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Broker:   {:<50} ║", args.broker);
    println!("║  Shard:    {:<50} ║", format!("{} of {}", args.shard, args.shards));
    println!("║  Tariff:   {:<50} ║", format!("{} cents/kWh", args.tariff_cents));
    println!("║  Archive:  {:<50} ║", args.archive_dir.display().to_string());
    println!("║  HTTP:     {:<50} ║", args.http);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let engine = match &args.profiles {
        Some(path) => StaticAuthorization::from_profiles_file(path, args.tariff_cents)?,
        None => {
            warn!("No customer profiles given, every credential will be denied");
            StaticAuthorization::new(args.tariff_cents)
        }
    };

    let archive = FileArchive::open(ArchiveConfig::default().with_dir(args.archive_dir.clone()))?;
    info!("Archive holds {} finished sessions", archive.load_all()?.len());

    let cancel = CancellationToken::new();
    let bus = RemoteBus::connect(RemoteBusConfig::new(&args.broker), cancel.clone()).await?;
    let gateway = Gateway::new(Arc::new(bus), GatewayConfig::default().with_shard_count(args.shards));

    let config = CoordinatorConfig::default()
        .with_shard(args.shard, args.shards)
        .with_auth_timeout(Duration::from_secs(args.auth_timeout_secs))
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_timeout_secs));

    let coordinator = Coordinator::new(config, gateway, Arc::new(engine), Arc::new(archive));
    let handle = coordinator.handle();
    let mut coordinator_task = tokio::spawn(coordinator.run(cancel.clone()));

    let listener = TcpListener::bind(args.http).await?;
    info!("HTTP queries on {}", args.http);
    let router = http::router(handle.clone());
    let http_shutdown = cancel.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
    });

    let (console_tx, mut console_rx) = mpsc::channel::<ConsoleCommand>(16);
    std::thread::spawn(move || read_console(console_tx));

    let mut coordinator_done = false;
    loop {
        tokio::select! {
            result = &mut coordinator_task => {
                log_coordinator_exit(result);
                coordinator_done = true;
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping coordinator");
                break;
            }

            command = console_rx.recv() => match command {
                Some(ConsoleCommand::Stop(station)) => stop(&handle, station).await,
                Some(ConsoleCommand::Sessions) => print_sessions(&handle),
                Some(ConsoleCommand::Quit) | None => break,
            },
        }
    }

    cancel.cancel();
    if !coordinator_done {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut coordinator_task).await {
            Ok(result) => log_coordinator_exit(result),
            Err(_) => {
                warn!("Coordinator still busy after {:?}, abandoning in-flight sessions", SHUTDOWN_GRACE);
                coordinator_task.abort();
            }
        }
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, http_task).await {
        Ok(Ok(Err(e))) => error!("HTTP server failed: {}", e),
        Ok(Err(e)) => error!("HTTP task panicked: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("HTTP server did not drain within {:?}", SHUTDOWN_GRACE),
    }
    Ok(())
}

fn log_coordinator_exit(result: Result<Result<(), CoordinatorError>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("Coordinator stopped"),
        Ok(Err(e)) => error!("Coordinator failed: {}", e),
        Err(e) => error!("Coordinator task panicked: {}", e),
    }
}

fn read_console(tx: mpsc::Sender<ConsoleCommand>) {
    println!("\nCommands:");
    println!("  stop <station>  - Request a remote stop");
    println!("  sessions        - Show sessions of this shard");
    println!("  quit            - Exit\n");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = match parts.as_slice() {
            [] => continue,
            ["stop", station] => ConsoleCommand::Stop(ChargePointId::new(*station)),
            ["sessions"] => ConsoleCommand::Sessions,
            ["quit"] | ["exit"] => ConsoleCommand::Quit,
            _ => {
                println!("Unknown command. Try: stop <station>, sessions, quit");
                continue;
            }
        };
        if tx.blocking_send(command).is_err() {
            break;
        }
    }
}

async fn stop(handle: &CoordinatorHandle, station: ChargePointId) {
    match handle.remote_stop(&station, "console").await {
        Ok(_) => println!("Stop requested for {}", station),
        Err(e) => println!("Stop request for {} failed: {}", station, e),
    }
}

fn print_sessions(handle: &CoordinatorHandle) {
    let sessions = handle.sessions();
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }
    for status in sessions {
        let reason = match (&status.stop_reason, &status.abort_reason) {
            (_, Some(abort)) => format!(" ({:?})", abort),
            (Some(stop), None) => format!(" ({:?})", stop),
            (None, None) => String::new(),
        };
        println!(
            "  {:<12} {:<22} {:>8.2} kWh  {}{}",
            status.charge_point_id.to_string(),
            status.state.to_string(),
            status.energy_kwh,
            status.session_id,
            reason
        );
    }
}
