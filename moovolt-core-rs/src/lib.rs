//! Moovolt Core Library
//!
//! Session coordination for the Moovolt charging platform. Charge point
//! adapters translate station traffic into domain events; the coordinator
//! turns those events into charging sessions, consults the authorization
//! engine and sends commands back, all over an at-least-once message bus.

pub mod types;
pub mod envelope;
pub mod event;
pub mod command;
pub mod bus;
pub mod dedupe;
pub mod session;
pub mod authorization;
pub mod archive;
pub mod coordinator;

pub use types::*;
pub use envelope::Envelope;
pub use event::{DomainEvent, EventKind};
pub use command::{CommandKind, DomainCommand, OperatorRequest};
pub use bus::{topics, Delivery, Gateway, GatewayConfig, MemoryBus, MessageBus, Subscription};
pub use dedupe::DedupeWindow;
pub use session::{Session, SessionState, SessionStatus, SessionSummary};
pub use authorization::{AuthError, AuthorizationEngine, StaticAuthorization};
pub use archive::{ArchiveConfig, FileArchive, SessionArchive};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle};
