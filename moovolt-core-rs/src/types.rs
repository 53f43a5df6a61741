//! Core types shared by the adapter fleet and the coordinator fleet

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Station-assigned transaction identifier (OCPP `transactionId`)
pub type TransactionId = String;

/// Unique identifier of a charging station
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargePointId(String);

impl ChargePointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard this station belongs to when the coordinator fleet has `count` shards
    pub fn shard(&self, count: u32) -> u32 {
        shard_of(&self.0, count)
    }
}

impl fmt::Display for ChargePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChargePointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque session identifier, generated when a session starts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token linking a command to the event or transition that caused it.
///
/// Station-originated ids are derived from the OCPP message id, so a station
/// retransmitting the same frame yields the same correlation id. Derived ids
/// (`<origin>/<suffix>`) stay stable when a cause is processed twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Correlation id for a frame received on one station link.
    ///
    /// OCPP message ids are only unique within a WebSocket connection, so
    /// the link tag keeps a station that restarts its counter after a
    /// reconnect from colliding with its earlier frames.
    pub fn from_station_message(charge_point_id: &ChargePointId, link: &str, message_id: &str) -> Self {
        Self(format!("{}:{}:{}", charge_point_id, link, message_id))
    }

    /// Child id for something caused by this one
    pub fn derive(&self, suffix: &str) -> Self {
        Self(format!("{}/{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Customer credential reference (RFID tag, app token, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration status of a station with the adapter fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Pending,
    Active,
    Suspended,
}

/// A charging station known to the adapter fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargePointIdentity {
    pub id: ChargePointId,
    /// WebSocket endpoint the adapter dials (station id is appended)
    pub endpoint: String,
    pub status: RegistrationStatus,
}

impl ChargePointIdentity {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: ChargePointId::new(id),
            endpoint: endpoint.into(),
            status: RegistrationStatus::Pending,
        }
    }

    pub fn activate(&mut self) {
        self.status = RegistrationStatus::Active;
    }

    /// Connection lost. Only an active station becomes suspended.
    pub fn suspend(&mut self) {
        if self.status == RegistrationStatus::Active {
            self.status = RegistrationStatus::Suspended;
        }
    }
}

/// Why an authorization request was denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DenialReason {
    UnknownCredential,
    Blocked,
    NoCredit,
    NotAllowedHere,
    Other(String),
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::UnknownCredential => write!(f, "unknown credential"),
            DenialReason::Blocked => write!(f, "credential blocked"),
            DenialReason::NoCredit => write!(f, "no credit"),
            DenialReason::NotAllowedHere => write!(f, "not allowed at this station"),
            DenialReason::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Result of consulting the authorization engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    Approved { limit_kwh: f64 },
    Denied { reason: DenialReason },
    /// Engine cannot decide yet (pending external credit check)
    Deferred,
}

/// Result of settling a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Captured { amount_cents: u64, energy_kwh: f64 },
    Failed { reason: String },
}

/// Why a session left `Charging`.
///
/// Declared in ascending precedence: when two stops race, the greater one is
/// kept, so a limit-exceeded stop always wins over a station stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StationStopped,
    HeartbeatLost,
    OperatorRequested,
    LimitExceeded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::StationStopped => "station stopped",
            StopReason::HeartbeatLost => "heartbeat lost",
            StopReason::OperatorRequested => "operator requested",
            StopReason::LimitExceeded => "energy limit exceeded",
        };
        f.write_str(s)
    }
}

/// Why a session ended in `Aborted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "abort", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    AuthDenied(DenialReason),
    AuthTimeout,
    StoppedBeforeAuthorization,
    PaymentFailed(String),
    SettlementUnavailable,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::AuthDenied(reason) => write!(f, "authorization denied: {}", reason),
            AbortReason::AuthTimeout => write!(f, "authorization timed out"),
            AbortReason::StoppedBeforeAuthorization => write!(f, "stopped before authorization"),
            AbortReason::PaymentFailed(reason) => write!(f, "payment failed: {}", reason),
            AbortReason::SettlementUnavailable => write!(f, "settlement unavailable"),
        }
    }
}

/// Stable FNV-1a based shard assignment
pub fn shard_of(key: &str, count: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % count.max(1)
}

/// 64-bit FNV-1a digest
pub fn fnv1a_64(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
