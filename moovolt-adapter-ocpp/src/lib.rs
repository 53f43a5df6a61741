//! # Moovolt OCPP Adapter
//!
//! Charge point adapter for the Moovolt session bus.
//!
//! Each adapter owns the WebSocket link to one charging station, translates
//! OCPP 2.0.1 traffic into domain events for the session coordinator and
//! executes the coordinator's commands on the station.
//!
//! ## Architecture
//!
//! ```text
//! Charging station (OCPP 2.0.1)
//!       │ WebSocket JSON-RPC
//!       ▼
//! ┌─────────────────────────────────┐
//! │    moovolt-adapter-ocpp         │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ Station   │◄►│ Translator │  │
//! │  │ Connection│  │ OCPP↔Domain│  │
//! │  └───────────┘  └────────────┘  │
//! └─────────────┬───────────────────┘
//!               │ envelopes (Gateway)
//!               ▼
//! ┌─────────────────────────────────┐
//! │    Session bus → Coordinator    │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use moovolt_adapter_ocpp::{Adapter, AdapterConfig};
//! use moovolt_core::{Gateway, GatewayConfig, MemoryBus};
//! use moovolt_core::bus::BusConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(MemoryBus::new(BusConfig::default()));
//!     let gateway = Gateway::new(bus, GatewayConfig::default());
//!     let config = AdapterConfig::new("CS001", "ws://localhost:9000/ocpp");
//!
//!     Adapter::new(config, gateway).run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod translator;
pub mod connection;
pub mod adapter;

pub use adapter::{Adapter, AdapterError};
pub use config::{AdapterConfig, ConnectionConfig};
pub use connection::{CommandAck, CommandSender, ConnectionError, StationConnection, OCPP_SUBPROTOCOL};
pub use translator::Translator;

// Re-export key types
pub use ocpp::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
