//! Domain events emitted by charge point adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{ChargePointId, CorrelationId, CredentialRef, TransactionId};

/// What happened at the station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    TransactionStarted {
        transaction_id: TransactionId,
        credential: CredentialRef,
        /// Register reading at start, when the station sent one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meter_start_kwh: Option<f64>,
    },
    /// Cumulative energy register reading
    MeterValueReported {
        transaction_id: TransactionId,
        energy_register_kwh: f64,
    },
    TransactionStopped {
        transaction_id: TransactionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meter_stop_kwh: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Heartbeat,
    StationRegistered {
        vendor: String,
        model: String,
    },
    StationDisconnected,
}

impl EventKind {
    /// Kind name as carried in the bus envelope
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TransactionStarted { .. } => "transaction_started",
            EventKind::MeterValueReported { .. } => "meter_value_reported",
            EventKind::TransactionStopped { .. } => "transaction_stopped",
            EventKind::Heartbeat => "heartbeat",
            EventKind::StationRegistered { .. } => "station_registered",
            EventKind::StationDisconnected => "station_disconnected",
        }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            EventKind::TransactionStarted { transaction_id, .. }
            | EventKind::MeterValueReported { transaction_id, .. }
            | EventKind::TransactionStopped { transaction_id, .. } => Some(transaction_id),
            _ => None,
        }
    }
}

/// Immutable fact reported by a charge point adapter
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub correlation_id: CorrelationId,
    pub charge_point_id: ChargePointId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(correlation_id: CorrelationId, charge_point_id: ChargePointId, kind: EventKind) -> Self {
        Self {
            correlation_id,
            charge_point_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        Envelope::new(
            self.correlation_id.clone(),
            self.charge_point_id.clone(),
            self.kind.name(),
            &self.kind,
        )
        .map(|envelope| envelope.at(self.timestamp))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            correlation_id: envelope.correlation_id.clone(),
            charge_point_id: envelope.charge_point_id.clone(),
            timestamp: envelope.timestamp,
            kind: envelope.decode()?,
        })
    }
}
