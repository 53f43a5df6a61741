//! Charging session state machine
//!
//! A session is created when a station reports a transaction start and is
//! driven by station events, authorization decisions, timers and the
//! settlement result:
//!
//! ```text
//! Idle -> AwaitingAuthorization -> Charging -> Stopping -> Settling -> Closed
//!                 |                                            |
//!                 +----------------> Aborted <-----------------+
//! ```
//!
//! The machine is pure. `Session::apply` returns the transition together
//! with the effects the owner must carry out (commands to publish, engine
//! calls, archiving); it never performs I/O itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::CommandKind;
use crate::types::{
    AbortReason, AuthorizationDecision, ChargePointId, CorrelationId, CredentialRef, SessionId,
    SettlementOutcome, StopReason, TransactionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingAuthorization,
    Charging,
    Stopping,
    Settling,
    Closed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }

    /// Started and not yet finished
    pub fn is_open(&self) -> bool {
        !self.is_terminal() && *self != SessionState::Idle
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "Idle",
            SessionState::AwaitingAuthorization => "AwaitingAuthorization",
            SessionState::Charging => "Charging",
            SessionState::Stopping => "Stopping",
            SessionState::Settling => "Settling",
            SessionState::Closed => "Closed",
            SessionState::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Everything that can move a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Started {
        transaction_id: TransactionId,
        credential: CredentialRef,
        meter_start_kwh: Option<f64>,
    },
    MeterValue {
        transaction_id: TransactionId,
        energy_register_kwh: f64,
    },
    StationStopped {
        transaction_id: TransactionId,
        meter_stop_kwh: Option<f64>,
    },
    Decision(AuthorizationDecision),
    /// Authorization deadline passed or the engine could not be reached
    AuthorizationTimedOut,
    OperatorStop,
    HeartbeatLost,
    /// The station never confirmed a coordinator-issued stop
    StopUnconfirmed,
    /// Energy total is final and the settlement request can be built
    SettlementComputed,
    Settled(SettlementOutcome),
    SettlementUnavailable,
}

impl SessionInput {
    pub fn name(&self) -> &'static str {
        match self {
            SessionInput::Started { .. } => "transaction_started",
            SessionInput::MeterValue { .. } => "meter_value_reported",
            SessionInput::StationStopped { .. } => "transaction_stopped",
            SessionInput::Decision(_) => "authorization_decision",
            SessionInput::AuthorizationTimedOut => "authorization_timed_out",
            SessionInput::OperatorStop => "operator_stop",
            SessionInput::HeartbeatLost => "heartbeat_lost",
            SessionInput::StopUnconfirmed => "stop_unconfirmed",
            SessionInput::SettlementComputed => "settlement_computed",
            SessionInput::Settled(_) => "settled",
            SessionInput::SettlementUnavailable => "settlement_unavailable",
        }
    }

    fn transaction_id(&self) -> Option<&str> {
        match self {
            SessionInput::Started { transaction_id, .. }
            | SessionInput::MeterValue { transaction_id, .. }
            | SessionInput::StationStopped { transaction_id, .. } => Some(transaction_id),
            _ => None,
        }
    }
}

/// Work the owner of a session has to carry out after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish a command to the station
    Command(CommandKind),
    /// Ask the authorization engine for a decision
    RequestAuthorization,
    /// Ask again after the deferral delay
    RetryAuthorization,
    /// Stop is confirmed, feed `SettlementComputed` back
    BeginSettlement,
    RequestSettlement(SessionSummary),
    Archive(SessionSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    /// False when the input left the session exactly as it was
    pub changed: bool,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: SessionState) -> Self {
        Self {
            from: state,
            to: state,
            changed: false,
            effects: Vec::new(),
        }
    }

    /// Nothing observable happened
    pub fn is_noop(&self) -> bool {
        !self.changed && self.effects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{input} is not valid in state {state}")]
    Invalid { state: SessionState, input: &'static str },

    #[error("event for transaction {got} does not belong to session transaction {expected}")]
    ForeignTransaction { expected: TransactionId, got: TransactionId },

    #[error("session {0} already finished")]
    Terminal(SessionId),
}

/// Record archived when a session finishes, and handed to settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub charge_point_id: ChargePointId,
    pub transaction_id: TransactionId,
    pub credential: CredentialRef,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub energy_kwh: f64,
    pub decision: Option<AuthorizationDecision>,
    pub stop_reason: Option<StopReason>,
    pub abort_reason: Option<AbortReason>,
    pub settlement: Option<SettlementOutcome>,
}

/// Update published on the status topic after every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub charge_point_id: ChargePointId,
    pub state: SessionState,
    pub energy_kwh: f64,
    pub stop_reason: Option<StopReason>,
    pub abort_reason: Option<AbortReason>,
    pub updated_at: DateTime<Utc>,
}

/// One charging session at one station
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub charge_point_id: ChargePointId,
    pub transaction_id: TransactionId,
    pub credential: CredentialRef,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Register baseline; the first reading seen when the start carried none
    pub meter_start_kwh: Option<f64>,
    /// Delivered energy, never decreases
    pub energy_kwh: f64,
    pub decision: Option<AuthorizationDecision>,
    pub stop_reason: Option<StopReason>,
    pub abort_reason: Option<AbortReason>,
    pub settlement: Option<SettlementOutcome>,
    /// Correlation id of the event that opened the session
    pub origin: CorrelationId,
    /// The coordinator has sent a RemoteStop
    pub stop_requested: bool,
    /// The station has reported the stop, or we gave up waiting
    pub stop_confirmed: bool,
}

impl Session {
    pub fn new(id: SessionId, charge_point_id: ChargePointId, origin: CorrelationId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            charge_point_id,
            transaction_id: TransactionId::new(),
            credential: CredentialRef::new(""),
            state: SessionState::Idle,
            started_at: now,
            stopped_at: None,
            ended_at: None,
            updated_at: now,
            meter_start_kwh: None,
            energy_kwh: 0.0,
            decision: None,
            stop_reason: None,
            abort_reason: None,
            settlement: None,
            origin,
            stop_requested: false,
            stop_confirmed: false,
        }
    }

    /// Granted energy, if approved
    pub fn limit_kwh(&self) -> Option<f64> {
        match self.decision {
            Some(AuthorizationDecision::Approved { limit_kwh }) => Some(limit_kwh),
            _ => None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            charge_point_id: self.charge_point_id.clone(),
            transaction_id: self.transaction_id.clone(),
            credential: self.credential.clone(),
            state: self.state,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            ended_at: self.ended_at,
            energy_kwh: self.energy_kwh,
            decision: self.decision.clone(),
            stop_reason: self.stop_reason,
            abort_reason: self.abort_reason.clone(),
            settlement: self.settlement.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            charge_point_id: self.charge_point_id.clone(),
            state: self.state,
            energy_kwh: self.energy_kwh,
            stop_reason: self.stop_reason,
            abort_reason: self.abort_reason.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Apply one input
    pub fn apply(&mut self, input: SessionInput, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        let from = self.state;
        if from.is_terminal() {
            return Err(TransitionError::Terminal(self.id.clone()));
        }

        if from != SessionState::Idle {
            if let Some(transaction_id) = input.transaction_id() {
                if transaction_id != self.transaction_id {
                    return match input {
                        SessionInput::Started { .. } => Err(self.invalid(&input)),
                        _ => Err(TransitionError::ForeignTransaction {
                            expected: self.transaction_id.clone(),
                            got: transaction_id.to_string(),
                        }),
                    };
                }
            }
        }

        let mut transition = match from {
            SessionState::Idle => self.on_idle(input, now)?,
            SessionState::AwaitingAuthorization => self.on_awaiting(input, now)?,
            SessionState::Charging => self.on_charging(input, now)?,
            SessionState::Stopping => self.on_stopping(input, now)?,
            SessionState::Settling => self.on_settling(input, now)?,
            SessionState::Closed | SessionState::Aborted => {
                return Err(TransitionError::Terminal(self.id.clone()))
            }
        };

        transition.from = from;
        transition.to = self.state;
        if from != self.state {
            transition.changed = true;
            info!(
                "Session {} ({}): {} -> {}",
                self.id, self.charge_point_id, from, self.state
            );
        }
        if transition.changed {
            self.updated_at = now;
        }
        if self.state.is_terminal() {
            self.ended_at = Some(now);
            transition.effects.push(Effect::Archive(self.summary()));
        }
        Ok(transition)
    }

    fn invalid(&self, input: &SessionInput) -> TransitionError {
        TransitionError::Invalid {
            state: self.state,
            input: input.name(),
        }
    }

    fn on_idle(&mut self, input: SessionInput, _now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match input {
            SessionInput::Started {
                transaction_id,
                credential,
                meter_start_kwh,
            } => {
                self.transaction_id = transaction_id;
                self.credential = credential;
                self.meter_start_kwh = meter_start_kwh;
                self.state = SessionState::AwaitingAuthorization;
                Ok(self.moved(vec![Effect::RequestAuthorization]))
            }
            other => Err(self.invalid(&other)),
        }
    }

    fn on_awaiting(&mut self, input: SessionInput, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match input {
            SessionInput::Started { .. } => Ok(Transition::unchanged(self.state)),

            SessionInput::Decision(AuthorizationDecision::Approved { limit_kwh }) => {
                self.decision = Some(AuthorizationDecision::Approved { limit_kwh });
                self.state = SessionState::Charging;
                let mut effects = vec![Effect::Command(CommandKind::AuthorizeStart {
                    session_id: self.id.clone(),
                    transaction_id: self.transaction_id.clone(),
                    limit_kwh,
                })];
                if self.energy_kwh > limit_kwh {
                    effects.push(self.request_stop(StopReason::LimitExceeded, now));
                }
                Ok(self.moved(effects))
            }

            SessionInput::Decision(AuthorizationDecision::Denied { reason }) => {
                warn!("Session {}: authorization denied: {}", self.id, reason);
                self.decision = Some(AuthorizationDecision::Denied { reason: reason.clone() });
                let abort = AbortReason::AuthDenied(reason);
                let stop = self.remote_stop(abort.to_string());
                self.abort(abort, now);
                Ok(self.moved(vec![stop]))
            }

            SessionInput::Decision(AuthorizationDecision::Deferred) => {
                debug!("Session {}: authorization deferred", self.id);
                self.decision = Some(AuthorizationDecision::Deferred);
                Ok(Transition {
                    changed: false,
                    effects: vec![Effect::RetryAuthorization],
                    ..Transition::unchanged(self.state)
                })
            }

            SessionInput::AuthorizationTimedOut => {
                warn!("Session {}: authorization timed out", self.id);
                let stop = self.remote_stop(AbortReason::AuthTimeout.to_string());
                self.abort(AbortReason::AuthTimeout, now);
                Ok(self.moved(vec![stop]))
            }

            SessionInput::MeterValue {
                energy_register_kwh, ..
            } => Ok(self.meter_only(energy_register_kwh)),

            SessionInput::StationStopped { meter_stop_kwh, .. } => {
                if let Some(reading) = meter_stop_kwh {
                    self.accumulate(reading);
                }
                self.stopped_at = Some(now);
                self.abort(AbortReason::StoppedBeforeAuthorization, now);
                Ok(self.moved(Vec::new()))
            }

            SessionInput::OperatorStop => {
                let stop = self.request_stop(StopReason::OperatorRequested, now);
                Ok(self.moved(vec![stop]))
            }

            other => Err(self.invalid(&other)),
        }
    }

    fn on_charging(&mut self, input: SessionInput, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match input {
            SessionInput::Started { .. } => Ok(Transition::unchanged(self.state)),

            SessionInput::MeterValue {
                energy_register_kwh, ..
            } => {
                let changed = self.accumulate(energy_register_kwh);
                match self.limit_kwh() {
                    Some(limit) if self.energy_kwh > limit => {
                        warn!(
                            "Session {}: {:.3} kWh exceeds limit of {:.3} kWh",
                            self.id, self.energy_kwh, limit
                        );
                        let stop = self.request_stop(StopReason::LimitExceeded, now);
                        Ok(self.moved(vec![stop]))
                    }
                    _ => Ok(Transition {
                        changed,
                        ..Transition::unchanged(self.state)
                    }),
                }
            }

            SessionInput::StationStopped { meter_stop_kwh, .. } => {
                if let Some(reading) = meter_stop_kwh {
                    self.accumulate(reading);
                }
                let reason = match self.limit_kwh() {
                    Some(limit) if self.energy_kwh > limit => StopReason::LimitExceeded,
                    _ => StopReason::StationStopped,
                };
                self.record_stop(reason, now);
                self.state = SessionState::Stopping;
                self.stop_confirmed = true;
                Ok(self.moved(vec![Effect::BeginSettlement]))
            }

            SessionInput::OperatorStop => {
                let stop = self.request_stop(StopReason::OperatorRequested, now);
                Ok(self.moved(vec![stop]))
            }

            SessionInput::HeartbeatLost => {
                warn!("Session {}: no sign of life from {}", self.id, self.charge_point_id);
                let stop = self.request_stop(StopReason::HeartbeatLost, now);
                Ok(self.moved(vec![stop]))
            }

            other => Err(self.invalid(&other)),
        }
    }

    fn on_stopping(&mut self, input: SessionInput, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match input {
            SessionInput::Started { .. } => Ok(Transition::unchanged(self.state)),

            SessionInput::MeterValue {
                energy_register_kwh, ..
            } => Ok(self.meter_only(energy_register_kwh)),

            SessionInput::StationStopped { meter_stop_kwh, .. } => {
                let mut changed = match meter_stop_kwh {
                    Some(reading) => self.accumulate(reading),
                    None => false,
                };
                if let Some(limit) = self.limit_kwh() {
                    if self.energy_kwh > limit {
                        changed |= self.record_stop(StopReason::LimitExceeded, now);
                    }
                }
                if self.stop_confirmed {
                    return Ok(Transition {
                        changed,
                        ..Transition::unchanged(self.state)
                    });
                }
                self.stop_confirmed = true;
                self.stopped_at = Some(now);
                Ok(Transition {
                    changed: true,
                    effects: vec![Effect::BeginSettlement],
                    ..Transition::unchanged(self.state)
                })
            }

            SessionInput::StopUnconfirmed => {
                if self.stop_confirmed {
                    return Ok(Transition::unchanged(self.state));
                }
                warn!(
                    "Session {}: {} did not confirm stop, settling {:.3} kWh",
                    self.id, self.charge_point_id, self.energy_kwh
                );
                self.stop_confirmed = true;
                Ok(Transition {
                    changed: true,
                    effects: vec![Effect::BeginSettlement],
                    ..Transition::unchanged(self.state)
                })
            }

            SessionInput::OperatorStop => Ok(Transition {
                changed: self.record_stop(StopReason::OperatorRequested, now),
                ..Transition::unchanged(self.state)
            }),

            SessionInput::HeartbeatLost => Ok(Transition {
                changed: self.record_stop(StopReason::HeartbeatLost, now),
                ..Transition::unchanged(self.state)
            }),

            SessionInput::SettlementComputed if self.stop_confirmed => {
                self.state = SessionState::Settling;
                let summary = self.summary();
                Ok(self.moved(vec![Effect::RequestSettlement(summary)]))
            }

            other => Err(self.invalid(&other)),
        }
    }

    fn on_settling(&mut self, input: SessionInput, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match input {
            SessionInput::Started { .. }
            | SessionInput::MeterValue { .. }
            | SessionInput::StationStopped { .. } => Ok(Transition::unchanged(self.state)),

            SessionInput::Settled(outcome) => {
                match &outcome {
                    SettlementOutcome::Captured { amount_cents, .. } => {
                        info!("Session {}: captured {} cents", self.id, amount_cents);
                        self.state = SessionState::Closed;
                    }
                    SettlementOutcome::Failed { reason } => {
                        warn!("Session {}: payment failed: {}", self.id, reason);
                        self.abort(AbortReason::PaymentFailed(reason.clone()), now);
                    }
                }
                self.settlement = Some(outcome);
                Ok(self.moved(Vec::new()))
            }

            SessionInput::SettlementUnavailable => {
                warn!("Session {}: settlement engine unavailable", self.id);
                self.abort(AbortReason::SettlementUnavailable, now);
                Ok(self.moved(Vec::new()))
            }

            other => Err(self.invalid(&other)),
        }
    }

    fn moved(&self, effects: Vec<Effect>) -> Transition {
        Transition {
            changed: true,
            effects,
            ..Transition::unchanged(self.state)
        }
    }

    /// Fold a cumulative register reading into the delivered energy
    fn accumulate(&mut self, register_kwh: f64) -> bool {
        let Some(start) = self.meter_start_kwh else {
            debug!(
                "Session {}: no start reading, {:.3} kWh is the baseline",
                self.id, register_kwh
            );
            self.meter_start_kwh = Some(register_kwh);
            return false;
        };
        let delivered = (register_kwh - start).max(0.0);
        if delivered > self.energy_kwh {
            self.energy_kwh = delivered;
            true
        } else {
            false
        }
    }

    fn meter_only(&mut self, register_kwh: f64) -> Transition {
        Transition {
            changed: self.accumulate(register_kwh),
            ..Transition::unchanged(self.state)
        }
    }

    /// Keep the stop reason with the highest precedence
    fn record_stop(&mut self, reason: StopReason, now: DateTime<Utc>) -> bool {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(now);
        }
        match self.stop_reason {
            Some(current) if current >= reason => false,
            _ => {
                self.stop_reason = Some(reason);
                true
            }
        }
    }

    fn request_stop(&mut self, reason: StopReason, now: DateTime<Utc>) -> Effect {
        self.record_stop(reason, now);
        self.state = SessionState::Stopping;
        self.stop_requested = true;
        self.remote_stop(reason.to_string())
    }

    fn remote_stop(&self, reason: String) -> Effect {
        Effect::Command(CommandKind::RemoteStop {
            session_id: Some(self.id.clone()),
            transaction_id: self.transaction_id.clone(),
            reason,
        })
    }

    fn abort(&mut self, reason: AbortReason, now: DateTime<Utc>) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(now);
        }
        self.abort_reason = Some(reason);
        self.state = SessionState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DenialReason;
    use proptest::prelude::*;

    fn started(tx: &str, credential: &str) -> SessionInput {
        SessionInput::Started {
            transaction_id: tx.into(),
            credential: CredentialRef::new(credential),
            meter_start_kwh: Some(0.0),
        }
    }

    fn meter(tx: &str, kwh: f64) -> SessionInput {
        SessionInput::MeterValue {
            transaction_id: tx.into(),
            energy_register_kwh: kwh,
        }
    }

    fn stopped(tx: &str, kwh: Option<f64>) -> SessionInput {
        SessionInput::StationStopped {
            transaction_id: tx.into(),
            meter_stop_kwh: kwh,
        }
    }

    fn approved(limit_kwh: f64) -> SessionInput {
        SessionInput::Decision(AuthorizationDecision::Approved { limit_kwh })
    }

    fn new_session() -> Session {
        Session::new(
            SessionId::new("s-1"),
            ChargePointId::new("CS001"),
            CorrelationId::new("CS001:1"),
            Utc::now(),
        )
    }

    fn charging_session(limit: f64) -> Session {
        let mut session = new_session();
        session.apply(started("A", "cred1"), Utc::now()).unwrap();
        session.apply(approved(limit), Utc::now()).unwrap();
        session
    }

    fn commands(transition: &Transition) -> Vec<&CommandKind> {
        transition
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Command(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_requests_authorization() {
        let mut session = new_session();
        let t = session.apply(started("A", "cred1"), Utc::now()).unwrap();
        assert_eq!(t.from, SessionState::Idle);
        assert_eq!(t.to, SessionState::AwaitingAuthorization);
        assert_eq!(t.effects, vec![Effect::RequestAuthorization]);
    }

    #[test]
    fn test_approval_authorizes_start_with_limit() {
        let mut session = new_session();
        session.apply(started("A", "cred1"), Utc::now()).unwrap();
        let t = session.apply(approved(30.0), Utc::now()).unwrap();

        assert_eq!(session.state, SessionState::Charging);
        assert_eq!(
            commands(&t),
            vec![&CommandKind::AuthorizeStart {
                session_id: SessionId::new("s-1"),
                transaction_id: "A".into(),
                limit_kwh: 30.0,
            }]
        );
    }

    #[test]
    fn test_limit_exceeded_forces_stop() {
        let mut session = charging_session(30.0);
        let t = session.apply(meter("A", 12.0), Utc::now()).unwrap();
        assert!(t.changed && t.effects.is_empty());
        assert_eq!(session.state, SessionState::Charging);

        let t = session.apply(meter("A", 31.0), Utc::now()).unwrap();
        assert_eq!(session.state, SessionState::Stopping);
        assert_eq!(session.stop_reason, Some(StopReason::LimitExceeded));
        assert!(matches!(
            &commands(&t)[..],
            [CommandKind::RemoteStop { transaction_id, .. }] if transaction_id == "A"
        ));
    }

    #[test]
    fn test_energy_is_monotonic_from_meter_start() {
        let mut session = new_session();
        session
            .apply(
                SessionInput::Started {
                    transaction_id: "A".into(),
                    credential: CredentialRef::new("cred1"),
                    meter_start_kwh: Some(100.0),
                },
                Utc::now(),
            )
            .unwrap();
        session.apply(approved(30.0), Utc::now()).unwrap();
        session.apply(meter("A", 110.5), Utc::now()).unwrap();
        session.apply(meter("A", 104.0), Utc::now()).unwrap();
        assert_eq!(session.energy_kwh, 10.5);
    }

    #[test]
    fn test_first_reading_is_baseline_without_meter_start() {
        let mut session = new_session();
        session
            .apply(
                SessionInput::Started {
                    transaction_id: "A".into(),
                    credential: CredentialRef::new("cred1"),
                    meter_start_kwh: None,
                },
                Utc::now(),
            )
            .unwrap();
        session.apply(approved(30.0), Utc::now()).unwrap();

        // lifetime register of the station, not delivered energy
        let t = session.apply(meter("A", 12_345.0), Utc::now()).unwrap();
        assert!(commands(&t).is_empty());
        assert_eq!(session.state, SessionState::Charging);
        assert_eq!(session.energy_kwh, 0.0);

        session.apply(meter("A", 12_352.5), Utc::now()).unwrap();
        assert_eq!(session.energy_kwh, 7.5);
        assert_eq!(session.stop_reason, None);
    }

    #[test]
    fn test_denial_aborts_with_remote_stop() {
        let mut session = new_session();
        session.apply(started("A", "cred1"), Utc::now()).unwrap();
        let t = session
            .apply(
                SessionInput::Decision(AuthorizationDecision::Denied {
                    reason: DenialReason::Blocked,
                }),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(
            session.abort_reason,
            Some(AbortReason::AuthDenied(DenialReason::Blocked))
        );
        assert_eq!(commands(&t).len(), 1);
        assert!(matches!(t.effects.last(), Some(Effect::Archive(_))));
    }

    #[test]
    fn test_deferred_keeps_waiting() {
        let mut session = new_session();
        session.apply(started("A", "cred1"), Utc::now()).unwrap();
        let t = session
            .apply(SessionInput::Decision(AuthorizationDecision::Deferred), Utc::now())
            .unwrap();
        assert_eq!(session.state, SessionState::AwaitingAuthorization);
        assert_eq!(t.effects, vec![Effect::RetryAuthorization]);

        let t = session.apply(SessionInput::AuthorizationTimedOut, Utc::now()).unwrap();
        assert_eq!(t.to, SessionState::Aborted);
        assert_eq!(session.abort_reason, Some(AbortReason::AuthTimeout));
        assert_eq!(commands(&t).len(), 1);
    }

    #[test]
    fn test_second_start_rejected() {
        let mut session = charging_session(30.0);
        let err = session.apply(started("B", "cred2"), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                state: SessionState::Charging,
                input: "transaction_started"
            }
        );
        assert_eq!(session.state, SessionState::Charging);
        assert_eq!(session.transaction_id, "A");

        let t = session.apply(started("A", "cred1"), Utc::now()).unwrap();
        assert!(t.is_noop());
    }

    #[test]
    fn test_station_stop_before_authorization_aborts() {
        let mut session = new_session();
        session.apply(started("A", "cred1"), Utc::now()).unwrap();
        session.apply(stopped("A", Some(0.2)), Utc::now()).unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(session.abort_reason, Some(AbortReason::StoppedBeforeAuthorization));
    }

    #[test]
    fn test_station_stop_settles_and_closes() {
        let mut session = charging_session(30.0);
        let t = session.apply(stopped("A", Some(12.5)), Utc::now()).unwrap();
        assert_eq!(t.to, SessionState::Stopping);
        assert_eq!(t.effects, vec![Effect::BeginSettlement]);
        assert_eq!(session.stop_reason, Some(StopReason::StationStopped));

        let t = session.apply(SessionInput::SettlementComputed, Utc::now()).unwrap();
        assert_eq!(t.to, SessionState::Settling);
        assert!(matches!(&t.effects[..], [Effect::RequestSettlement(s)] if s.energy_kwh == 12.5));

        let t = session
            .apply(
                SessionInput::Settled(SettlementOutcome::Captured {
                    amount_cents: 500,
                    energy_kwh: 12.5,
                }),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.to, SessionState::Closed);
        match &t.effects[..] {
            [Effect::Archive(summary)] => {
                assert_eq!(summary.state, SessionState::Closed);
                assert!(summary.ended_at.is_some());
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_final_meter_over_limit_recorded_as_limit_exceeded() {
        let mut session = charging_session(30.0);
        session.apply(stopped("A", Some(30.5)), Utc::now()).unwrap();
        assert_eq!(session.stop_reason, Some(StopReason::LimitExceeded));
    }

    #[test]
    fn test_stop_reason_precedence_while_stopping() {
        let mut session = charging_session(30.0);
        session.apply(SessionInput::HeartbeatLost, Utc::now()).unwrap();
        assert_eq!(session.stop_reason, Some(StopReason::HeartbeatLost));

        let t = session.apply(SessionInput::OperatorStop, Utc::now()).unwrap();
        assert!(t.effects.is_empty());
        assert_eq!(session.stop_reason, Some(StopReason::OperatorRequested));

        session.apply(stopped("A", Some(5.0)), Utc::now()).unwrap();
        assert_eq!(session.stop_reason, Some(StopReason::OperatorRequested));
    }

    #[test]
    fn test_operator_stop_in_stopping_is_idempotent() {
        let mut session = charging_session(30.0);
        let t = session.apply(SessionInput::OperatorStop, Utc::now()).unwrap();
        assert_eq!(commands(&t).len(), 1);

        let t = session.apply(SessionInput::OperatorStop, Utc::now()).unwrap();
        assert!(t.is_noop());
    }

    #[test]
    fn test_operator_stop_invalid_while_settling() {
        let mut session = charging_session(30.0);
        session.apply(stopped("A", None), Utc::now()).unwrap();
        session.apply(SessionInput::SettlementComputed, Utc::now()).unwrap();

        let err = session.apply(SessionInput::OperatorStop, Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { state: SessionState::Settling, .. }));
    }

    #[test]
    fn test_unconfirmed_stop_settles_last_known_energy() {
        let mut session = charging_session(30.0);
        session.apply(meter("A", 8.0), Utc::now()).unwrap();
        session.apply(SessionInput::OperatorStop, Utc::now()).unwrap();

        let err = session.apply(SessionInput::SettlementComputed, Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));

        let t = session.apply(SessionInput::StopUnconfirmed, Utc::now()).unwrap();
        assert_eq!(t.effects, vec![Effect::BeginSettlement]);
        let t = session.apply(SessionInput::SettlementComputed, Utc::now()).unwrap();
        assert!(matches!(&t.effects[..], [Effect::RequestSettlement(s)] if s.energy_kwh == 8.0));
    }

    #[test]
    fn test_failed_payment_aborts() {
        let mut session = charging_session(30.0);
        session.apply(stopped("A", Some(3.0)), Utc::now()).unwrap();
        session.apply(SessionInput::SettlementComputed, Utc::now()).unwrap();
        session
            .apply(
                SessionInput::Settled(SettlementOutcome::Failed {
                    reason: "credit exceeded".into(),
                }),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(
            session.abort_reason,
            Some(AbortReason::PaymentFailed("credit exceeded".into()))
        );
    }

    #[test]
    fn test_foreign_transaction_rejected() {
        let mut session = charging_session(30.0);
        let err = session.apply(meter("Z", 50.0), Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::ForeignTransaction { .. }));
        assert_eq!(session.energy_kwh, 0.0);
    }

    #[test]
    fn test_summary_serialization_round_trip() {
        let mut session = charging_session(30.0);
        session.apply(stopped("A", Some(12.5)), Utc::now()).unwrap();
        let summary = session.summary();
        let json = serde_json::to_string(&summary).unwrap();
        let decoded: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, summary);
    }

    fn any_input() -> impl Strategy<Value = SessionInput> {
        let tx = prop_oneof![Just("A".to_string()), Just("B".to_string())];
        prop_oneof![
            tx.clone().prop_map(|t| started(&t, "cred1")),
            (tx.clone(), 0u32..80).prop_map(|(t, kwh)| meter(&t, kwh as f64 * 0.5)),
            (tx, proptest::option::of(0u32..80)).prop_map(|(t, kwh)| stopped(&t, kwh.map(|k| k as f64 * 0.5))),
            (1u32..40).prop_map(|l| approved(l as f64)),
            proptest::sample::select(vec![
                SessionInput::Decision(AuthorizationDecision::Denied {
                    reason: DenialReason::NoCredit
                }),
                SessionInput::Decision(AuthorizationDecision::Deferred),
                SessionInput::AuthorizationTimedOut,
                SessionInput::OperatorStop,
                SessionInput::HeartbeatLost,
                SessionInput::StopUnconfirmed,
                SessionInput::SettlementComputed,
                SessionInput::Settled(SettlementOutcome::Captured {
                    amount_cents: 100,
                    energy_kwh: 1.0
                }),
                SessionInput::SettlementUnavailable,
            ]),
        ]
    }

    fn is_station_event(input: &SessionInput) -> bool {
        matches!(
            input,
            SessionInput::Started { .. } | SessionInput::MeterValue { .. } | SessionInput::StationStopped { .. }
        )
    }

    proptest! {
        #[test]
        fn prop_terminal_states_are_never_left(inputs in proptest::collection::vec(any_input(), 1..40)) {
            let mut session = new_session();
            session.apply(started("A", "cred1"), Utc::now()).unwrap();

            let mut terminal: Option<SessionState> = None;
            for input in inputs {
                let result = session.apply(input, Utc::now());
                if let Some(state) = terminal {
                    prop_assert!(matches!(result, Err(TransitionError::Terminal(_))));
                    prop_assert_eq!(session.state, state);
                } else if session.state.is_terminal() {
                    terminal = Some(session.state);
                }
            }
        }

        #[test]
        fn prop_repeated_station_event_is_invisible(
            prefix in proptest::collection::vec(any_input(), 0..20),
            event in any_input().prop_filter("station events", is_station_event),
        ) {
            let mut session = new_session();
            session.apply(started("A", "cred1"), Utc::now()).unwrap();
            for input in prefix {
                let _ = session.apply(input, Utc::now());
            }

            let _ = session.apply(event.clone(), Utc::now());
            let state = session.state;
            let energy = session.energy_kwh;
            if let Ok(t) = session.apply(event, Utc::now()) {
                prop_assert!(t.is_noop(), "repeat produced {:?}", t);
            }
            prop_assert_eq!(session.state, state);
            prop_assert_eq!(session.energy_kwh, energy);
        }
    }
}
