//! Commands issued by the coordinator toward charge point adapters, and
//! operator requests issued toward the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{ChargePointId, CorrelationId, SessionId, TransactionId};

/// Instruction for a station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    AuthorizeStart {
        session_id: SessionId,
        transaction_id: TransactionId,
        limit_kwh: f64,
    },
    RemoteStop {
        /// `None` when stopping a transaction that was never admitted as a session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        transaction_id: TransactionId,
        reason: String,
    },
    SetChargingProfile {
        transaction_id: TransactionId,
        limit_kw: f64,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::AuthorizeStart { .. } => "authorize_start",
            CommandKind::RemoteStop { .. } => "remote_stop",
            CommandKind::SetChargingProfile { .. } => "set_charging_profile",
        }
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            CommandKind::AuthorizeStart { transaction_id, .. }
            | CommandKind::RemoteStop { transaction_id, .. }
            | CommandKind::SetChargingProfile { transaction_id, .. } => transaction_id,
        }
    }
}

/// Immutable instruction from the coordinator to one station
#[derive(Debug, Clone, PartialEq)]
pub struct DomainCommand {
    pub correlation_id: CorrelationId,
    pub charge_point_id: ChargePointId,
    pub issued_at: DateTime<Utc>,
    pub kind: CommandKind,
}

impl DomainCommand {
    pub fn new(correlation_id: CorrelationId, charge_point_id: ChargePointId, kind: CommandKind) -> Self {
        Self {
            correlation_id,
            charge_point_id,
            issued_at: Utc::now(),
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
        .map(|envelope| envelope.at(self.issued_at))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            correlation_id: envelope.correlation_id.clone(),
            charge_point_id: envelope.charge_point_id.clone(),
            issued_at: envelope.timestamp,
            kind: envelope.decode()?,
        })
    }
}

/// Request from an operator (console or front-end) for one station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorRequest {
    RemoteStop { requested_by: String },
}

impl OperatorRequest {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorRequest::RemoteStop { .. } => "remote_stop",
        }
    }

    pub fn to_envelope(
        &self,
        correlation_id: CorrelationId,
        charge_point_id: ChargePointId,
    ) -> Result<Envelope, serde_json::Error> {
        Envelope::new(correlation_id, charge_point_id, self.name(), self)
    }
}
