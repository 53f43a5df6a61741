//! Bus envelope: the record every topic carries

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChargePointId, CorrelationId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub charge_point_id: ChargePointId,
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        correlation_id: CorrelationId,
        charge_point_id: ChargePointId,
        kind: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            correlation_id,
            charge_point_id,
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    /// Override the timestamp (keeps the time of the original fact)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Parse the payload as a specific type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
