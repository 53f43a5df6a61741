//! OCPP 2.0.1 protocol implementation
//!
//! - `types`: OCPP message types and data structures
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
