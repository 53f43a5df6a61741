//! OCPP <-> domain translation
//!
//! ## Station -> Domain
//!
//! | OCPP Action                  | Response             | Domain event           |
//! |------------------------------|----------------------|------------------------|
//! | BootNotification             | Accepted + interval  | `StationRegistered`    |
//! | Heartbeat                    | current time         | `Heartbeat`            |
//! | StatusNotification           | empty                | -                      |
//! | TransactionEvent (Started)   | empty                | `TransactionStarted`   |
//! | TransactionEvent (Updated)   | empty                | `MeterValueReported`   |
//! | TransactionEvent (Ended)     | empty                | `TransactionStopped`   |
//! | MeterValues                  | empty                | `MeterValueReported`   |
//!
//! ## Domain -> Station
//!
//! | Command              | OCPP Action                                      |
//! |----------------------|--------------------------------------------------|
//! | `RemoteStop`         | RequestStopTransaction                           |
//! | `SetChargingProfile` | SetChargingProfile (TxProfile, W)                |
//! | `AuthorizeStart`     | DataTransfer (`moovolt` / `AuthorizeStart`)      |
//!
//! Events are correlated by station, link and OCPP message id. A command is
//! sent under its correlation id, or under a stable digest of it when the id
//! is longer than OCPP-J allows, so redeliveries and replays reuse the same
//! message id.

use std::collections::HashMap;
use std::time::Duration;

use moovolt_core::{
    fnv1a_64, ChargePointId, CommandKind, CorrelationId, CredentialRef, DomainCommand, DomainEvent, EventKind,
    TransactionId,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ocpp::messages::*;
use crate::ocpp::types::*;

/// Vendor id carried in DataTransfer commands
pub const VENDOR_ID: &str = "moovolt";

/// DataTransfer message id announcing an authorized session
pub const AUTHORIZE_START: &str = "AuthorizeStart";

/// Longest message id OCPP-J accepts
pub const MAX_MESSAGE_ID_LEN: usize = 36;

/// OCPP message id a command is sent under
pub fn ocpp_message_id(correlation_id: &CorrelationId) -> String {
    let id = correlation_id.as_str();
    if id.len() <= MAX_MESSAGE_ID_LEN {
        id.to_string()
    } else {
        format!("mv-{:016x}", fnv1a_64(id))
    }
}

/// Outcome of one station CALL
#[derive(Debug)]
pub struct Translation {
    /// CALLRESULT or CALLERROR to send back
    pub response: OcppMessage,
    /// Domain event to publish, if the CALL carried one
    pub event: Option<DomainEvent>,
}

impl Translation {
    fn reply(call: &Call, payload: impl serde::Serialize) -> Self {
        let response = match CallResult::new(call.message_id.clone(), payload) {
            Ok(result) => OcppMessage::CallResult(result),
            Err(e) => OcppMessage::CallError(CallError::new(
                call.message_id.clone(),
                ErrorCode::InternalError,
                e.to_string(),
            )),
        };
        Self { response, event: None }
    }

    fn error(message_id: &str, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            response: OcppMessage::CallError(CallError::new(message_id.to_string(), code, description)),
            event: None,
        }
    }

    fn with_event(mut self, event: DomainEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// Per-station translation state
pub struct Translator {
    charge_point_id: ChargePointId,
    heartbeat_interval: Duration,
    /// Tag of the current WebSocket link
    link: String,
    /// Last transaction started on each EVSE
    by_evse: HashMap<i32, TransactionId>,
}

impl Translator {
    pub fn new(charge_point_id: ChargePointId, heartbeat_interval: Duration) -> Self {
        Self {
            charge_point_id,
            heartbeat_interval,
            link: new_link_tag(),
            by_evse: HashMap::new(),
        }
    }

    /// A new WebSocket link was established
    pub fn start_link(&mut self) {
        self.link = new_link_tag();
        debug!("Translator: {} on link {}", self.charge_point_id, self.link);
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    fn event(&self, call: &Call, kind: EventKind) -> DomainEvent {
        DomainEvent::new(
            CorrelationId::from_station_message(&self.charge_point_id, &self.link, &call.message_id),
            self.charge_point_id.clone(),
            kind,
        )
    }

    /// Translate a station CALL into its response and domain event
    pub fn handle_call(&mut self, call: &Call) -> Translation {
        let result = match call.action {
            Action::BootNotification => self.boot_notification(call),
            Action::Heartbeat => Ok(self.heartbeat(call)),
            Action::StatusNotification => self.status_notification(call),
            Action::TransactionEvent => self.transaction_event(call),
            Action::MeterValues => self.meter_values(call),
            Action::DataTransfer => Ok(Translation::reply(
                call,
                DataTransferResponse {
                    status: DataTransferStatus::UnknownVendorId,
                    data: None,
                },
            )),
            Action::SetChargingProfile | Action::RequestStopTransaction => Ok(Translation::error(
                &call.message_id,
                ErrorCode::NotSupported,
                format!("{} is not accepted from a station", call.action),
            )),
        };

        result.unwrap_or_else(|e| {
            warn!(
                "Translator: malformed {} {} from {}: {}",
                call.action, call.message_id, self.charge_point_id, e
            );
            Translation::error(&call.message_id, ErrorCode::FormatViolation, e.to_string())
        })
    }

    fn boot_notification(&mut self, call: &Call) -> Result<Translation, OcppError> {
        let req: BootNotificationRequest = call.parse_payload()?;
        info!(
            "Translator: {} booted ({} {}, {:?})",
            self.charge_point_id, req.charging_station.vendor_name, req.charging_station.model, req.reason
        );

        let interval = self.heartbeat_interval.as_secs().min(i32::MAX as u64) as i32;
        let response = CallResult::boot_notification(call.message_id.clone(), interval)?;
        let event = self.event(
            call,
            EventKind::StationRegistered {
                vendor: req.charging_station.vendor_name,
                model: req.charging_station.model,
            },
        );

        Ok(Translation {
            response: OcppMessage::CallResult(response),
            event: Some(event),
        })
    }

    fn heartbeat(&self, call: &Call) -> Translation {
        Translation::reply(call, HeartbeatResponse { current_time: chrono::Utc::now() })
            .with_event(self.event(call, EventKind::Heartbeat))
    }

    fn status_notification(&self, call: &Call) -> Result<Translation, OcppError> {
        let req: StatusNotificationRequest = call.parse_payload()?;
        debug!(
            "Translator: {} EVSE {} connector {} is {:?}",
            self.charge_point_id, req.evse_id, req.connector_id, req.connector_status
        );
        Ok(Translation::reply(call, EmptyResponse {}))
    }

    fn transaction_event(&mut self, call: &Call) -> Result<Translation, OcppError> {
        let req: TransactionEventRequest = call.parse_payload()?;
        let transaction_id = req.transaction_info.transaction_id.clone();
        let register = req.meter_value.as_deref().and_then(energy_register_kwh);

        let kind = match req.event_type {
            TransactionEventType::Started => {
                if let Some(evse) = &req.evse {
                    self.by_evse.insert(evse.id, transaction_id.clone());
                }
                let credential = req
                    .id_token
                    .map(|token| CredentialRef::new(token.id_token))
                    .unwrap_or_else(|| CredentialRef::new(""));
                Some(EventKind::TransactionStarted {
                    transaction_id,
                    credential,
                    meter_start_kwh: register,
                })
            }
            TransactionEventType::Updated => register.map(|energy| EventKind::MeterValueReported {
                transaction_id,
                energy_register_kwh: energy,
            }),
            TransactionEventType::Ended => {
                self.by_evse.retain(|_, tx| *tx != transaction_id);
                Some(EventKind::TransactionStopped {
                    transaction_id,
                    meter_stop_kwh: register,
                    reason: req.transaction_info.stopped_reason,
                })
            }
        };

        let translation = Translation::reply(call, TransactionEventResponse::default());
        Ok(match kind {
            Some(kind) => translation.with_event(self.event(call, kind)),
            None => translation,
        })
    }

    fn meter_values(&self, call: &Call) -> Result<Translation, OcppError> {
        let req: MeterValuesRequest = call.parse_payload()?;
        let translation = Translation::reply(call, EmptyResponse {});

        let Some(transaction_id) = self.by_evse.get(&req.evse_id).cloned() else {
            debug!(
                "Translator: {} meter values on idle EVSE {}",
                self.charge_point_id, req.evse_id
            );
            return Ok(translation);
        };

        Ok(match energy_register_kwh(&req.meter_value) {
            Some(energy) => translation.with_event(self.event(
                call,
                EventKind::MeterValueReported {
                    transaction_id,
                    energy_register_kwh: energy,
                },
            )),
            None => translation,
        })
    }

    /// EVSE a running transaction was started on
    pub fn evse_of(&self, transaction_id: &str) -> Option<i32> {
        self.by_evse
            .iter()
            .find(|(_, tx)| tx.as_str() == transaction_id)
            .map(|(evse, _)| *evse)
    }

    /// Build the station CALL executing a command
    pub fn command_to_call(&self, command: &DomainCommand) -> Result<Call, OcppError> {
        let message_id = ocpp_message_id(&command.correlation_id);
        let message_id = message_id.as_str();

        match &command.kind {
            CommandKind::RemoteStop { transaction_id, .. } => {
                Call::request_stop_transaction(message_id, transaction_id)
            }
            CommandKind::SetChargingProfile { transaction_id, limit_kw } => {
                // TxProfile requires a concrete EVSE
                let evse_id = self.evse_of(transaction_id).unwrap_or(1);
                Call::set_charging_profile(
                    message_id,
                    evse_id,
                    ChargingProfile::transaction_limit(evse_id, transaction_id, limit_kw * 1000.0),
                )
            }
            CommandKind::AuthorizeStart {
                session_id,
                transaction_id,
                limit_kwh,
            } => Call::data_transfer(
                message_id,
                VENDOR_ID,
                AUTHORIZE_START,
                json!({
                    "transactionId": transaction_id,
                    "sessionId": session_id,
                    "energyLimitKwh": limit_kwh,
                }),
            ),
        }
    }
}

fn new_link_tag() -> String {
    let mut tag = Uuid::new_v4().simple().to_string();
    tag.truncate(8);
    tag
}
