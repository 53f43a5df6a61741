//! OCPP 2.0.1 message types
//!
//! The subset of OCPP 2.0.1 the adapter speaks:
//! - BootNotification / Heartbeat / StatusNotification (station -> adapter)
//! - TransactionEvent / MeterValues (station -> adapter)
//! - RequestStopTransaction / SetChargingProfile / DataTransfer (adapter -> station)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Enumerations
// ============================================================================

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Charging profile purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargingStationMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

/// Charging profile kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

/// Charging rate unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

/// Generic OCPP status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// DataTransfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

/// TransactionEvent type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionEventType {
    Started,
    Updated,
    Ended,
}

/// Measurand types for meter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurand {
    #[serde(rename = "Current.Import")]
    CurrentImport,
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
    #[serde(rename = "Energy.Active.Export.Register")]
    EnergyActiveExportRegister,
    #[serde(rename = "Power.Active.Import")]
    PowerActiveImport,
    #[serde(rename = "Voltage")]
    Voltage,
    #[serde(rename = "SoC")]
    SoC,
}

/// Reading context for meter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    #[serde(rename = "Interruption.Begin")]
    InterruptionBegin,
    #[serde(rename = "Interruption.End")]
    InterruptionEnd,
    #[serde(rename = "Sample.Clock")]
    SampleClock,
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
    #[serde(rename = "Transaction.Begin")]
    TransactionBegin,
    #[serde(rename = "Transaction.End")]
    TransactionEnd,
    Trigger,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

// ============================================================================
// Complex Types
// ============================================================================

/// EVSE identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EVSE {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

/// Token for identification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    pub id_token: String,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// Charging schedule period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

/// Charging schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub id: i32,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
}

/// Charging profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    pub charging_schedule: Vec<ChargingSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl ChargingProfile {
    /// Single-period power cap for one transaction
    pub fn transaction_limit(id: i32, transaction_id: &str, limit_w: f64) -> Self {
        Self {
            id,
            stack_level: 0,
            charging_profile_purpose: ChargingProfilePurpose::TxProfile,
            charging_profile_kind: ChargingProfileKind::Absolute,
            charging_schedule: vec![ChargingSchedule {
                id,
                charging_rate_unit: ChargingRateUnit::W,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: limit_w,
                    number_phases: None,
                }],
                start_schedule: None,
            }],
            transaction_id: Some(transaction_id.to_string()),
        }
    }
}

/// Unit of a sampled value; OCPP defaults to Wh with multiplier 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOfMeasure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<i32>,
}

/// Sampled value for meter readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measure: Option<UnitOfMeasure>,
}

impl SampledValue {
    /// Reading in kWh if this is an active import register sample
    pub fn energy_register_kwh(&self) -> Option<f64> {
        // Absent measurand means Energy.Active.Import.Register
        match self.measurand {
            None | Some(Measurand::EnergyActiveImportRegister) => {}
            Some(_) => return None,
        }
        if self.phase.is_some() {
            return None;
        }

        let (unit, multiplier) = match &self.unit_of_measure {
            Some(u) => (u.unit.as_deref().unwrap_or("Wh"), u.multiplier.unwrap_or(0)),
            None => ("Wh", 0),
        };
        let value = self.value * 10f64.powi(multiplier);
        match unit {
            "Wh" => Some(value / 1000.0),
            "kWh" => Some(value),
            _ => None,
        }
    }
}

/// Meter value with timestamp and samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

/// Latest energy register reading across meter values, in kWh
pub fn energy_register_kwh(meter_values: &[MeterValue]) -> Option<f64> {
    meter_values
        .iter()
        .flat_map(|mv| mv.sampled_value.iter())
        .filter_map(SampledValue::energy_register_kwh)
        .last()
}

/// Status info for responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

/// Charging station information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Transaction part of a TransactionEvent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
}

// ============================================================================
// Station -> Adapter
// ============================================================================

/// BootNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

/// BootNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// Heartbeat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// Heartbeat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// StatusNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

/// Empty response (StatusNotification, MeterValues)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyResponse {}

/// TransactionEvent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEventRequest {
    pub event_type: TransactionEventType,
    pub timestamp: DateTime<Utc>,
    pub trigger_reason: String,
    pub seq_no: i32,
    pub transaction_info: TransactionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evse: Option<EVSE>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_value: Option<Vec<MeterValue>>,
}

/// TransactionEvent response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEventResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

/// MeterValues request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub evse_id: i32,
    pub meter_value: Vec<MeterValue>,
}

// ============================================================================
// Adapter -> Station
// ============================================================================

/// RequestStopTransaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStopTransactionRequest {
    pub transaction_id: String,
}

/// SetChargingProfile request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub evse_id: i32,
    pub charging_profile: ChargingProfile,
}

/// Response carrying a generic status (RequestStopTransaction, SetChargingProfile)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: GenericStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// DataTransfer request (either direction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// DataTransfer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64, unit: Option<&str>) -> SampledValue {
        SampledValue {
            value,
            context: None,
            measurand: None,
            phase: None,
            unit_of_measure: unit.map(|u| UnitOfMeasure {
                unit: Some(u.to_string()),
                multiplier: None,
            }),
        }
    }

    #[test]
    fn test_charging_profile_serialization() {
        let profile = ChargingProfile::transaction_limit(7, "tx-1", 11_000.0);
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["chargingProfilePurpose"], "TxProfile");
        assert_eq!(json["transactionId"], "tx-1");
        assert_eq!(json["chargingSchedule"][0]["chargingSchedulePeriod"][0]["limit"], 11_000.0);
    }

    #[test]
    fn test_energy_register_units() {
        assert_eq!(sample(12_500.0, None).energy_register_kwh(), Some(12.5));
        assert_eq!(sample(12.5, Some("kWh")).energy_register_kwh(), Some(12.5));
        assert_eq!(sample(3.0, Some("A")).energy_register_kwh(), None);

        let mut scaled = sample(12.5, Some("Wh"));
        scaled.unit_of_measure = Some(UnitOfMeasure {
            unit: Some("Wh".into()),
            multiplier: Some(3),
        });
        assert_eq!(scaled.energy_register_kwh(), Some(12.5));

        let mut power = sample(7_000.0, Some("W"));
        power.measurand = Some(Measurand::PowerActiveImport);
        assert_eq!(power.energy_register_kwh(), None);
    }

    #[test]
    fn test_transaction_event_parsing() {
        let json = r#"{
            "eventType": "Started",
            "timestamp": "2026-01-20T12:00:00Z",
            "triggerReason": "Authorized",
            "seqNo": 0,
            "transactionInfo": {"transactionId": "tx-1"},
            "idToken": {"idToken": "TAG1", "type": "ISO14443"},
            "evse": {"id": 1, "connectorId": 1},
            "meterValue": [{
                "timestamp": "2026-01-20T12:00:00Z",
                "sampledValue": [
                    {"value": 230.0, "measurand": "Voltage"},
                    {"value": 1500.0, "measurand": "Energy.Active.Import.Register"}
                ]
            }]
        }"#;

        let req: TransactionEventRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.event_type, TransactionEventType::Started);
        assert_eq!(req.id_token.unwrap().id_token, "TAG1");
        assert_eq!(energy_register_kwh(&req.meter_value.unwrap()), Some(1.5));
    }

    #[test]
    fn test_boot_notification_request() {
        let req = BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: "MV-22".to_string(),
                vendor_name: "Moovolt".to_string(),
                serial_number: Some("MV-001".to_string()),
                firmware_version: Some("0.1.0".to_string()),
            },
            reason: BootReason::PowerUp,
        };

        let json = serde_json::to_string(&req).unwrap();
        let parsed: BootNotificationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }
}
