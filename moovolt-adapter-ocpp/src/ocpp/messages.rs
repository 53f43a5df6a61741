//! OCPP 2.0.1 JSON-RPC message framing
//!
//! OCPP uses JSON-RPC 2.0 over WebSocket with a specific message format:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

/// OCPP action names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    TransactionEvent,

    // CSMS -> CP
    SetChargingProfile,
    RequestStopTransaction,

    // Bidirectional
    DataTransfer,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "TransactionEvent" => Ok(Action::TransactionEvent),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            "RequestStopTransaction" => Ok(Action::RequestStopTransaction),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    /// Create a CALL message with a caller-chosen ID
    pub fn with_id(
        message_id: impl Into<String>,
        action: Action,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create BootNotification call
    pub fn boot_notification(station: ChargingStationInfo, reason: BootReason) -> Result<Self, OcppError> {
        Self::new(
            Action::BootNotification,
            BootNotificationRequest {
                charging_station: station,
                reason,
            },
        )
    }

    /// Create Heartbeat call
    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    /// Create StatusNotification call
    pub fn status_notification(
        evse_id: i32,
        connector_id: i32,
        status: ConnectorStatus,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::StatusNotification,
            StatusNotificationRequest {
                timestamp: Utc::now(),
                connector_status: status,
                evse_id,
                connector_id,
            },
        )
    }

    /// Create MeterValues call
    pub fn meter_values(evse_id: i32, meter_value: Vec<MeterValue>) -> Result<Self, OcppError> {
        Self::new(
            Action::MeterValues,
            MeterValuesRequest { evse_id, meter_value },
        )
    }

    /// Create TransactionEvent call
    pub fn transaction_event(request: TransactionEventRequest) -> Result<Self, OcppError> {
        Self::new(Action::TransactionEvent, request)
    }

    /// Create RequestStopTransaction call
    pub fn request_stop_transaction(
        message_id: impl Into<String>,
        transaction_id: &str,
    ) -> Result<Self, OcppError> {
        Self::with_id(
            message_id,
            Action::RequestStopTransaction,
            RequestStopTransactionRequest {
                transaction_id: transaction_id.to_string(),
            },
        )
    }

    /// Create SetChargingProfile call
    pub fn set_charging_profile(
        message_id: impl Into<String>,
        evse_id: i32,
        profile: ChargingProfile,
    ) -> Result<Self, OcppError> {
        Self::with_id(
            message_id,
            Action::SetChargingProfile,
            SetChargingProfileRequest {
                evse_id,
                charging_profile: profile,
            },
        )
    }

    /// Create DataTransfer call
    pub fn data_transfer(
        message_id: impl Into<String>,
        vendor_id: &str,
        data_message_id: &str,
        data: Value,
    ) -> Result<Self, OcppError> {
        Self::with_id(
            message_id,
            Action::DataTransfer,
            DataTransferRequest {
                vendor_id: vendor_id.to_string(),
                message_id: Some(data_message_id.to_string()),
                data: Some(data),
            },
        )
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create response for BootNotification
    pub fn boot_notification(message_id: String, interval_secs: i32) -> Result<Self, OcppError> {
        Self::new(
            message_id,
            BootNotificationResponse {
                current_time: Utc::now(),
                interval: interval_secs,
                status: RegistrationStatus::Accepted,
                status_info: None,
            },
        )
    }

    /// Create response for Heartbeat
    pub fn heartbeat(message_id: String) -> Result<Self, OcppError> {
        Self::new(message_id, HeartbeatResponse { current_time: Utc::now() })
    }

    /// Create response with a generic status (RequestStopTransaction, SetChargingProfile)
    pub fn status(message_id: String, status: GenericStatus) -> Result<Self, OcppError> {
        Self::new(message_id, StatusResponse { status, status_info: None })
    }

    /// `status` field of the payload equals `Accepted`
    pub fn is_accepted(&self) -> bool {
        self.payload.get("status").and_then(Value::as_str) == Some("Accepted")
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0]
            .as_i64()
            .ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                let action_str = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?;

                let action: Action = action_str.parse()?;
                let payload = array[3].clone();

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                let error_code_str = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?;

                let error_code: ErrorCode = serde_json::from_value(
                    Value::String(error_code_str.to_string())
                ).unwrap_or(ErrorCode::GenericError);

                let error_description = array[3]
                    .as_str()
                    .unwrap_or("")
                    .to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Message id of a CALL frame that failed to parse, when it is still readable
    pub fn recover_call_id(bytes: &[u8]) -> Option<String> {
        let array: Vec<Value> = serde_json::from_slice(bytes).ok()?;
        if array.first()?.as_i64()? != MessageType::Call as i64 {
            return None;
        }
        array.get(1)?.as_str().map(str::to_string)
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }

    /// Serialize to a WebSocket text payload
    pub fn to_text(&self) -> Result<String, OcppError> {
        let bytes = self.to_bytes()?;
        String::from_utf8(bytes).map_err(|_| OcppError::InvalidFormat)
    }
}
