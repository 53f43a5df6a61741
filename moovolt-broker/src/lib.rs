//! # Moovolt Broker
//!
//! Network message broker for the Moovolt session bus. The broker node hosts
//! a `MemoryBus` behind WebSocket connections speaking a small JSON frame
//! protocol; `RemoteBus` is the client side and implements `MessageBus`, so
//! adapters and coordinators run unchanged against either.
//!
//! ```text
//! moovolt-ocpp-node          moovolt-coordinator-node
//!   Gateway<RemoteBus>          Gateway<RemoteBus>
//!        │   WebSocket JSON frames   │
//!        └──────────┐   ┌────────────┘
//!                   ▼   ▼
//!           ┌──────────────────┐
//!           │  moovolt-broker  │
//!           │    MemoryBus     │
//!           └──────────────────┘
//! ```

pub mod frame;
pub mod server;
pub mod client;

use thiserror::Error;

pub use client::{RemoteBus, RemoteBusConfig};
pub use frame::{BrokerFrame, ClientFrame};
pub use server::{Broker, BrokerConfig};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
