//! Session coordinator
//!
//! Consumes station events and operator requests for one shard and drives
//! the session state machine. Every charge point gets its own lane: a task
//! that owns the station's open session, its dedupe window and its timers,
//! so sessions are only ever mutated by a single writer. Engine calls run in
//! spawned tasks and report back into the lane.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveError, SessionArchive};
use crate::authorization::{AuthError, AuthorizationEngine};
use crate::bus::{topics, BusError, Delivery, DeliveryError, DeliveryReceipt, Gateway};
use crate::command::{CommandKind, DomainCommand, OperatorRequest};
use crate::dedupe::DedupeWindow;
use crate::event::{DomainEvent, EventKind};
use crate::session::{Effect, Session, SessionInput, SessionState, SessionStatus, TransitionError};
use crate::types::{
    AuthorizationDecision, ChargePointId, CorrelationId, CredentialRef, SessionId, SettlementOutcome,
    TransactionId,
};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shard owned by this coordinator
    pub shard: u32,
    pub shard_count: u32,
    /// Time allowed for an authorization decision
    pub auth_timeout: Duration,
    /// Delay before asking again after a deferred decision
    pub deferred_retry: Duration,
    /// Silence from a charging station before the session is stopped
    pub heartbeat_timeout: Duration,
    /// Time the station has to confirm a RemoteStop
    pub stop_confirmation_timeout: Duration,
    pub settlement_timeout: Duration,
    /// Correlation ids remembered per station
    pub dedupe_window: usize,
    /// Finished transactions remembered per station
    pub recent_sessions: usize,
    /// Consumer group on the shard topics
    pub group: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard: 0,
            shard_count: 1,
            auth_timeout: Duration::from_secs(30),
            deferred_retry: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(300),
            stop_confirmation_timeout: Duration::from_secs(60),
            settlement_timeout: Duration::from_secs(30),
            dedupe_window: 1024,
            recent_sessions: 64,
            group: "coordinator".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_shard(mut self, shard: u32, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self.shard = shard % self.shard_count;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_deferred_retry(mut self, delay: Duration) -> Self {
        self.deferred_retry = delay;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_stop_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.stop_confirmation_timeout = timeout;
        self
    }

    pub fn with_settlement_timeout(mut self, timeout: Duration) -> Self {
        self.settlement_timeout = timeout;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

type StatusBoard = Arc<RwLock<HashMap<ChargePointId, SessionStatus>>>;

struct Shared {
    config: CoordinatorConfig,
    gateway: Gateway,
    engine: Arc<dyn AuthorizationEngine>,
    archive: Arc<dyn SessionArchive>,
    board: StatusBoard,
}

/// Work handed to a lane
enum LaneInput {
    Event {
        event: DomainEvent,
        delivery: Delivery,
    },
    Operator {
        correlation_id: CorrelationId,
        request: OperatorRequest,
        delivery: Delivery,
    },
    Decision {
        session_id: SessionId,
        result: Result<AuthorizationDecision, AuthError>,
    },
    Settlement {
        session_id: SessionId,
        result: Result<SettlementOutcome, AuthError>,
    },
}

/// Coordinator for one shard
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        gateway: Gateway,
        engine: Arc<dyn AuthorizationEngine>,
        archive: Arc<dyn SessionArchive>,
    ) -> Self {
        if gateway.config().shard_count != config.shard_count {
            warn!(
                "Coordinator: gateway routes over {} shards, coordinator expects {}",
                gateway.config().shard_count,
                config.shard_count
            );
        }
        Self {
            shared: Arc::new(Shared {
                config,
                gateway,
                engine,
                archive,
                board: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn owns(&self, charge_point_id: &ChargePointId) -> bool {
        charge_point_id.shard(self.shared.config.shard_count) == self.shared.config.shard
    }

    /// Consume the shard's topics until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoordinatorError> {
        let config = &self.shared.config;
        let gateway = &self.shared.gateway;
        let mut events = gateway
            .subscribe(&topics::station_events(config.shard), &config.group)
            .await?;
        let mut operator = gateway
            .subscribe(&topics::operator(config.shard), &config.group)
            .await?;

        info!(
            "Coordinator: serving shard {}/{} as group {}",
            config.shard, config.shard_count, config.group
        );

        let mut lanes: Lanes = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Coordinator: shard {} shutting down ({} lanes)", config.shard, lanes.len());
                    // lanes finish the input they are working on
                    for (_, lane) in lanes.drain() {
                        drop(lane.tx);
                        let _ = lane.task.await;
                    }
                    return Ok(());
                }

                delivery = events.next() => match delivery {
                    Some(delivery) => self.route_event(&mut lanes, delivery, &cancel),
                    None => return Err(CoordinatorError::Bus(BusError::Disconnected)),
                },

                delivery = operator.next() => match delivery {
                    Some(delivery) => self.route_operator(&mut lanes, delivery, &cancel),
                    None => return Err(CoordinatorError::Bus(BusError::Disconnected)),
                },
            }
        }
    }

    fn route_event(
        &self,
        lanes: &mut Lanes,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) {
        let event = match DomainEvent::from_envelope(delivery.envelope()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Coordinator: discarding malformed {} ({}): {}",
                    delivery.envelope().kind,
                    delivery.envelope().correlation_id,
                    e
                );
                delivery.ack();
                return;
            }
        };

        if !self.owns(&event.charge_point_id) {
            warn!(
                "Coordinator: {} belongs to another shard, discarding {}",
                event.charge_point_id, event.correlation_id
            );
            delivery.ack();
            return;
        }

        let charge_point_id = event.charge_point_id.clone();
        self.dispatch(lanes, charge_point_id, LaneInput::Event { event, delivery }, cancel);
    }

    fn route_operator(
        &self,
        lanes: &mut Lanes,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) {
        let envelope = delivery.envelope();
        let request = match envelope.decode::<OperatorRequest>() {
            Ok(request) => request,
            Err(e) => {
                warn!("Coordinator: discarding malformed operator request: {}", e);
                delivery.ack();
                return;
            }
        };
        let correlation_id = envelope.correlation_id.clone();
        let charge_point_id = envelope.charge_point_id.clone();

        if !self.owns(&charge_point_id) {
            warn!("Coordinator: operator request for foreign station {}", charge_point_id);
            delivery.ack();
            return;
        }

        self.dispatch(
            lanes,
            charge_point_id,
            LaneInput::Operator {
                correlation_id,
                request,
                delivery,
            },
            cancel,
        );
    }

    fn dispatch(
        &self,
        lanes: &mut Lanes,
        charge_point_id: ChargePointId,
        input: LaneInput,
        cancel: &CancellationToken,
    ) {
        let input = match lanes.get(&charge_point_id) {
            Some(lane) => match lane.tx.send(input) {
                Ok(()) => return,
                Err(SendError(input)) => {
                    error!("Coordinator: lane for {} died, restarting it", charge_point_id);
                    input
                }
            },
            None => input,
        };

        let lane = self.spawn_lane(charge_point_id.clone(), cancel.clone());
        if lane.tx.send(input).is_err() {
            error!("Coordinator: fresh lane for {} is gone", charge_point_id);
        }
        lanes.insert(charge_point_id, lane);
    }

    fn spawn_lane(&self, charge_point_id: ChargePointId, cancel: CancellationToken) -> LaneHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Coordinator: opening lane for {}", charge_point_id);
        let lane = Lane::new(charge_point_id, Arc::clone(&self.shared), tx.clone());
        LaneHandle {
            tx,
            task: tokio::spawn(lane.run(rx, cancel)),
        }
    }
}

struct LaneHandle {
    tx: mpsc::UnboundedSender<LaneInput>,
    task: JoinHandle<()>,
}

type Lanes = HashMap<ChargePointId, LaneHandle>;

/// Operator access to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    /// Ask the coordinator owning `charge_point_id` to stop its session
    pub async fn remote_stop(
        &self,
        charge_point_id: &ChargePointId,
        requested_by: impl Into<String>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let request = OperatorRequest::RemoteStop {
            requested_by: requested_by.into(),
        };
        self.shared.gateway.publish_operator(charge_point_id, &request).await
    }

    /// Latest status of every station this coordinator has seen a session for
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self.shared.board.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.charge_point_id.cmp(&b.charge_point_id));
        sessions
    }

    pub fn status(&self, charge_point_id: &ChargePointId) -> Option<SessionStatus> {
        self.shared.board.read().get(charge_point_id).cloned()
    }
}

/// Owner of one station's sessions
struct Lane {
    charge_point_id: ChargePointId,
    shared: Arc<Shared>,
    feedback: mpsc::UnboundedSender<LaneInput>,
    session: Option<Session>,
    /// Finished (transaction, session) pairs, oldest first
    recent: VecDeque<(TransactionId, SessionId)>,
    dedupe: DedupeWindow,
    last_seen: Instant,
    auth_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    stop_deadline: Option<Instant>,
}

impl Lane {
    fn new(charge_point_id: ChargePointId, shared: Arc<Shared>, feedback: mpsc::UnboundedSender<LaneInput>) -> Self {
        let dedupe = DedupeWindow::new(shared.config.dedupe_window);
        Self {
            charge_point_id,
            shared,
            feedback,
            session: None,
            recent: VecDeque::new(),
            dedupe,
            last_seen: Instant::now(),
            auth_deadline: None,
            retry_at: None,
            stop_deadline: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LaneInput>, cancel: CancellationToken) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,

                input = rx.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },

                _ = sleep_until(deadline) => self.on_timer().await,
            }
        }
        debug!("Coordinator: lane for {} stopped", self.charge_point_id);
    }

    async fn handle(&mut self, input: LaneInput) {
        match input {
            LaneInput::Event { event, delivery } => {
                self.last_seen = Instant::now();
                if self.dedupe.insert(&event.correlation_id) {
                    self.on_event(event).await;
                } else {
                    debug!(
                        "Coordinator: duplicate {} ({}) from {}",
                        event.kind.name(),
                        event.correlation_id,
                        self.charge_point_id
                    );
                }
                delivery.ack();
            }

            LaneInput::Operator {
                correlation_id,
                request,
                delivery,
            } => {
                if self.dedupe.insert(&correlation_id) {
                    self.on_operator(correlation_id, request).await;
                }
                delivery.ack();
            }

            LaneInput::Decision { session_id, result } => self.on_decision(session_id, result).await,

            LaneInput::Settlement { session_id, result } => self.on_settlement(session_id, result).await,
        }
    }

    async fn on_event(&mut self, event: DomainEvent) {
        let cause = event.correlation_id;
        match event.kind {
            EventKind::TransactionStarted {
                transaction_id,
                credential,
                meter_start_kwh,
            } => {
                self.on_started(cause, event.timestamp, transaction_id, credential, meter_start_kwh)
                    .await
            }

            EventKind::MeterValueReported {
                transaction_id,
                energy_register_kwh,
            } => {
                let input = SessionInput::MeterValue {
                    transaction_id: transaction_id.clone(),
                    energy_register_kwh,
                };
                self.on_transaction_event(cause, &transaction_id, input).await
            }

            EventKind::TransactionStopped {
                transaction_id,
                meter_stop_kwh,
                reason,
            } => {
                if let Some(reason) = reason {
                    debug!("Coordinator: {} stopped {}: {}", self.charge_point_id, transaction_id, reason);
                }
                let input = SessionInput::StationStopped {
                    transaction_id: transaction_id.clone(),
                    meter_stop_kwh,
                };
                self.on_transaction_event(cause, &transaction_id, input).await
            }

            EventKind::Heartbeat => debug!("Coordinator: heartbeat from {}", self.charge_point_id),

            EventKind::StationRegistered { vendor, model } => {
                info!("Coordinator: {} registered ({} {})", self.charge_point_id, vendor, model)
            }

            EventKind::StationDisconnected => {
                info!("Coordinator: {} disconnected from its adapter", self.charge_point_id)
            }
        }
    }

    fn recently_closed(&self, transaction_id: &str) -> bool {
        self.recent.iter().any(|(tx, _)| tx == transaction_id)
    }

    async fn on_started(
        &mut self,
        cause: CorrelationId,
        timestamp: DateTime<Utc>,
        transaction_id: TransactionId,
        credential: CredentialRef,
        meter_start_kwh: Option<f64>,
    ) {
        if self.recently_closed(&transaction_id) {
            debug!(
                "Coordinator: start of finished transaction {} on {}, discarding",
                transaction_id, self.charge_point_id
            );
            return;
        }

        if let Some(session) = self.session.as_ref().filter(|s| s.state.is_open()) {
            if session.transaction_id == transaction_id {
                debug!("Coordinator: repeated start of {} on {}", transaction_id, self.charge_point_id);
                return;
            }

            let rejection = TransitionError::Invalid {
                state: session.state,
                input: "transaction_started",
            };
            warn!(
                "Coordinator: rejecting transaction {} on {} while session {} is open: {}",
                transaction_id, self.charge_point_id, session.id, rejection
            );
            let command = DomainCommand::new(
                cause.derive("remote_stop"),
                self.charge_point_id.clone(),
                CommandKind::RemoteStop {
                    session_id: None,
                    transaction_id,
                    reason: "another session is open on this station".into(),
                },
            );
            self.publish_command(command).await;
            return;
        }

        let session = Session::new(SessionId::generate(), self.charge_point_id.clone(), cause.clone(), timestamp);
        info!(
            "Coordinator: session {} for transaction {} on {}",
            session.id, transaction_id, self.charge_point_id
        );
        self.session = Some(session);
        self.apply(
            SessionInput::Started {
                transaction_id,
                credential,
                meter_start_kwh,
            },
            &cause,
        )
        .await;
    }

    async fn on_transaction_event(&mut self, cause: CorrelationId, transaction_id: &str, input: SessionInput) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.transaction_id == transaction_id)
        {
            self.apply(input, &cause).await;
        } else if self.recently_closed(transaction_id) {
            debug!(
                "Coordinator: {} for finished transaction {} on {}, discarding",
                input.name(),
                transaction_id,
                self.charge_point_id
            );
        } else {
            warn!(
                "Coordinator: {} for unknown transaction {} on {}",
                input.name(),
                transaction_id,
                self.charge_point_id
            );
        }
    }

    async fn on_operator(&mut self, correlation_id: CorrelationId, request: OperatorRequest) {
        match request {
            OperatorRequest::RemoteStop { requested_by } => {
                if self.session.as_ref().is_some_and(|s| s.state.is_open()) {
                    info!("Coordinator: {} requested stop on {}", requested_by, self.charge_point_id);
                    self.apply(SessionInput::OperatorStop, &correlation_id).await;
                } else {
                    warn!(
                        "Coordinator: {} requested stop on {} but no session is open",
                        requested_by, self.charge_point_id
                    );
                }
            }
        }
    }

    fn current_in(&self, session_id: &SessionId, state: SessionState) -> Option<CorrelationId> {
        self.session
            .as_ref()
            .filter(|s| &s.id == session_id && s.state == state)
            .map(|s| s.origin.clone())
    }

    async fn on_decision(&mut self, session_id: SessionId, result: Result<AuthorizationDecision, AuthError>) {
        let Some(origin) = self.current_in(&session_id, SessionState::AwaitingAuthorization) else {
            debug!("Coordinator: dropping stale decision for session {}", session_id);
            return;
        };

        match result {
            Ok(decision) => self.apply(SessionInput::Decision(decision), &origin).await,
            Err(e) => {
                warn!("Coordinator: no decision for session {}: {}", session_id, e);
                self.apply(SessionInput::AuthorizationTimedOut, &origin.derive("auth-unavailable"))
                    .await
            }
        }
    }

    async fn on_settlement(&mut self, session_id: SessionId, result: Result<SettlementOutcome, AuthError>) {
        let Some(origin) = self.current_in(&session_id, SessionState::Settling) else {
            debug!("Coordinator: dropping stale settlement for session {}", session_id);
            return;
        };

        let cause = origin.derive("settlement");
        match result {
            Ok(outcome) => self.apply(SessionInput::Settled(outcome), &cause).await,
            Err(e) => {
                error!("Coordinator: settlement of session {} failed: {}", session_id, e);
                self.apply(SessionInput::SettlementUnavailable, &cause).await
            }
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let Some(session) = self.session.as_ref() else {
            self.clear_timers();
            return;
        };
        let state = session.state;
        let origin = session.origin.clone();

        if self.auth_deadline.is_some_and(|at| at <= now) {
            self.auth_deadline = None;
            self.retry_at = None;
            if state == SessionState::AwaitingAuthorization {
                self.apply(SessionInput::AuthorizationTimedOut, &origin.derive("auth-timeout"))
                    .await;
            }
            return;
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if state == SessionState::AwaitingAuthorization {
                debug!("Coordinator: asking again for session {}", session.id);
                self.spawn_authorization();
            }
            return;
        }

        if self.stop_deadline.is_some_and(|at| at <= now) {
            self.stop_deadline = None;
            self.apply(SessionInput::StopUnconfirmed, &origin.derive("stop-timeout"))
                .await;
            return;
        }

        if state == SessionState::Charging && self.last_seen + self.shared.config.heartbeat_timeout <= now {
            self.last_seen = now;
            self.apply(SessionInput::HeartbeatLost, &origin.derive("heartbeat-lost"))
                .await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = match &self.session {
            Some(s) if s.state == SessionState::Charging => Some(self.last_seen + self.shared.config.heartbeat_timeout),
            _ => None,
        };
        [self.auth_deadline, self.retry_at, self.stop_deadline, heartbeat]
            .into_iter()
            .flatten()
            .min()
    }

    fn clear_timers(&mut self) {
        self.auth_deadline = None;
        self.retry_at = None;
        self.stop_deadline = None;
    }

    /// Align timers with the session after a transition out of `from`
    fn arm_timers(&mut self, from: SessionState) {
        let now = Instant::now();
        let config = &self.shared.config;
        let Some(session) = &self.session else {
            self.clear_timers();
            return;
        };

        if session.state == SessionState::AwaitingAuthorization {
            if from == SessionState::Idle {
                self.auth_deadline = Some(now + config.auth_timeout);
            }
        } else {
            self.auth_deadline = None;
            self.retry_at = None;
        }

        if session.state == SessionState::Stopping && session.stop_requested && !session.stop_confirmed {
            if self.stop_deadline.is_none() {
                self.stop_deadline = Some(now + config.stop_confirmation_timeout);
            }
        } else {
            self.stop_deadline = None;
        }
    }

    /// Feed an input through the session, carrying out effects
    async fn apply(&mut self, input: SessionInput, cause: &CorrelationId) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let name = input.name();
            let transition = match session.apply(input, Utc::now()) {
                Ok(transition) => transition,
                Err(TransitionError::Terminal(id)) => {
                    debug!("Coordinator: {} after session {} finished", name, id);
                    continue;
                }
                Err(e) => {
                    warn!("Coordinator: {} on {}: {}", name, self.charge_point_id, e);
                    continue;
                }
            };

            if transition.is_noop() {
                debug!("Coordinator: {} left session {} unchanged", name, session.id);
                continue;
            }

            let status = transition.changed.then(|| session.status());
            let terminal = session.state.is_terminal();
            self.arm_timers(transition.from);
            if let Some(status) = &status {
                self.shared
                    .board
                    .write()
                    .insert(self.charge_point_id.clone(), status.clone());
            }

            for effect in transition.effects {
                self.execute(effect, cause, &mut pending).await;
            }

            if let Some(status) = status {
                if self.shared.gateway.publish_status(cause, &status).await.is_err() {
                    error!(
                        "Coordinator: status {} of session {} not published",
                        status.state, status.session_id
                    );
                }
            }

            if terminal {
                self.retire();
            }
        }
    }

    async fn execute(&mut self, effect: Effect, cause: &CorrelationId, pending: &mut VecDeque<SessionInput>) {
        match effect {
            Effect::Command(kind) => {
                let command = DomainCommand::new(cause.derive(kind.name()), self.charge_point_id.clone(), kind);
                self.publish_command(command).await;
            }

            Effect::RequestAuthorization => self.spawn_authorization(),

            Effect::RetryAuthorization => {
                let at = Instant::now() + self.shared.config.deferred_retry;
                if self.auth_deadline.is_some_and(|deadline| at < deadline) {
                    self.retry_at = Some(at);
                }
            }

            Effect::BeginSettlement => pending.push_back(SessionInput::SettlementComputed),

            Effect::RequestSettlement(summary) => {
                let engine = Arc::clone(&self.shared.engine);
                let feedback = self.feedback.clone();
                let budget = self.shared.config.settlement_timeout;
                tokio::spawn(async move {
                    let result = match time::timeout(budget, engine.settle(&summary)).await {
                        Ok(result) => result,
                        Err(_) => Err(AuthError::Timeout),
                    };
                    let _ = feedback.send(LaneInput::Settlement {
                        session_id: summary.session_id,
                        result,
                    });
                });
            }

            Effect::Archive(summary) => {
                let session_id = summary.session_id.clone();
                let archive = Arc::clone(&self.shared.archive);
                let result = task::spawn_blocking(move || archive.record(&summary))
                    .await
                    .unwrap_or_else(|e| Err(ArchiveError::Io(std::io::Error::other(e.to_string()))));
                if let Err(e) = result {
                    error!("Coordinator: archiving session {} failed: {}", session_id, e);
                }
            }
        }
    }

    fn spawn_authorization(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let engine = Arc::clone(&self.shared.engine);
        let feedback = self.feedback.clone();
        let session_id = session.id.clone();
        let credential = session.credential.clone();
        let charge_point_id = self.charge_point_id.clone();
        let budget = self
            .auth_deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(self.shared.config.auth_timeout);

        tokio::spawn(async move {
            let result = match time::timeout(budget, engine.evaluate(&credential, &charge_point_id)).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::Timeout),
            };
            let _ = feedback.send(LaneInput::Decision { session_id, result });
        });
    }

    async fn publish_command(&self, command: DomainCommand) {
        info!(
            "Coordinator: {} -> {} ({})",
            command.kind.name(),
            command.charge_point_id,
            command.correlation_id
        );
        if let Err(e) = self.shared.gateway.publish_command(&command).await {
            error!(
                "Coordinator: command {} for {} lost: {}",
                command.correlation_id, command.charge_point_id, e
            );
        }
    }

    /// Move the finished session into the recent window
    fn retire(&mut self) {
        if let Some(session) = self.session.take() {
            while self.recent.len() >= self.shared.config.recent_sessions.max(1) {
                self.recent.pop_front();
            }
            self.recent.push_back((session.transaction_id, session.id));
        }
        self.clear_timers();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::authorization::{CustomerProfile, StaticAuthorization};
    use crate::bus::{GatewayConfig, MemoryBus, Subscription};
    use crate::session::SessionSummary;
    use crate::types::{AbortReason, DenialReason, StopReason};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        gateway: Gateway,
        commands: Subscription,
        status: Subscription,
        archive: Arc<MemoryArchive>,
        handle: CoordinatorHandle,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn cp() -> ChargePointId {
        ChargePointId::new("CS001")
    }

    fn profile(credential: &str) -> CustomerProfile {
        CustomerProfile {
            credential: CredentialRef::new(credential),
            name: "Ivo Kovač".into(),
            nickname: None,
            national_id: "98765432109".into(),
            region_code: "HR-01".into(),
            product_ref: "basic".into(),
            phone: None,
            email: Some("ivo@example.com".into()),
            credit_limit_cents: 10_000,
        }
    }

    fn static_engine() -> Arc<dyn AuthorizationEngine> {
        Arc::new(
            StaticAuthorization::new(40)
                .with_profile(profile("cred1"))
                .with_profile(profile("cred2"))
                .with_product_cap("basic", 30.0),
        )
    }

    async fn start(engine: Arc<dyn AuthorizationEngine>, config: CoordinatorConfig) -> Harness {
        let bus = MemoryBus::default();
        let gateway = Gateway::new(Arc::new(bus.clone()), GatewayConfig::default());
        let commands = bus.subscribe_now(&topics::station_commands(&cp()), "adapter").unwrap();
        let status = bus.subscribe_now(topics::SESSION_STATUS, "front-end").unwrap();
        let archive = Arc::new(MemoryArchive::new());

        let coordinator = Coordinator::new(config, gateway.clone(), engine, archive.clone());
        let handle = coordinator.handle();
        let cancel = CancellationToken::new();
        tokio::spawn(coordinator.run(cancel.clone()));

        Harness {
            gateway,
            commands,
            status,
            archive,
            handle,
            cancel,
        }
    }

    impl Harness {
        async fn send(&self, message_id: &str, kind: EventKind) {
            self.send_on("l1", message_id, kind).await
        }

        /// Event received on a given adapter link
        async fn send_on(&self, link: &str, message_id: &str, kind: EventKind) {
            let event = DomainEvent::new(CorrelationId::from_station_message(&cp(), link, message_id), cp(), kind);
            self.gateway.publish_event(&event).await.unwrap();
        }

        async fn start_tx(&self, message_id: &str, tx: &str, credential: &str) {
            self.send(
                message_id,
                EventKind::TransactionStarted {
                    transaction_id: tx.into(),
                    credential: CredentialRef::new(credential),
                    meter_start_kwh: Some(0.0),
                },
            )
            .await;
        }

        async fn meter(&self, message_id: &str, tx: &str, kwh: f64) {
            self.send(
                message_id,
                EventKind::MeterValueReported {
                    transaction_id: tx.into(),
                    energy_register_kwh: kwh,
                },
            )
            .await;
        }

        async fn stopped(&self, message_id: &str, tx: &str, kwh: f64) {
            self.send(
                message_id,
                EventKind::TransactionStopped {
                    transaction_id: tx.into(),
                    meter_stop_kwh: Some(kwh),
                    reason: Some("EVDisconnected".into()),
                },
            )
            .await;
        }

        async fn next_command(&mut self) -> DomainCommand {
            let delivery = time::timeout(WAIT, self.commands.next()).await.unwrap().unwrap();
            let command = DomainCommand::from_envelope(delivery.envelope()).unwrap();
            delivery.ack();
            command
        }

        async fn no_command(&mut self) {
            assert!(time::timeout(Duration::from_millis(200), self.commands.next()).await.is_err());
        }

        async fn wait_for_state(&mut self, state: SessionState) -> SessionStatus {
            loop {
                let delivery = time::timeout(WAIT, self.status.next()).await.unwrap().unwrap();
                let status: SessionStatus = delivery.envelope().decode().unwrap();
                delivery.ack();
                if status.state == state {
                    return status;
                }
            }
        }

        fn archived(&self) -> Vec<SessionSummary> {
            self.archive.load_all().unwrap()
        }
    }

    /// Engine answering from a script, one decision per call
    struct ScriptedEngine {
        decisions: Mutex<VecDeque<AuthorizationDecision>>,
        hang: bool,
    }

    #[async_trait]
    impl AuthorizationEngine for ScriptedEngine {
        async fn evaluate(
            &self,
            _credential: &CredentialRef,
            _charge_point_id: &ChargePointId,
        ) -> Result<AuthorizationDecision, AuthError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = self.decisions.lock().pop_front();
            next.ok_or_else(|| AuthError::Unavailable("script exhausted".into()))
        }

        async fn settle(&self, summary: &SessionSummary) -> Result<SettlementOutcome, AuthError> {
            Ok(SettlementOutcome::Captured {
                amount_cents: 0,
                energy_kwh: summary.energy_kwh,
            })
        }
    }

    #[tokio::test]
    async fn test_approved_session_charges_and_closes() {
        let mut h = start(static_engine(), CoordinatorConfig::default()).await;

        h.start_tx("1", "A", "cred1").await;
        let command = h.next_command().await;
        assert_eq!(command.correlation_id.as_str(), "CS001:l1:1/authorize_start");
        match command.kind {
            CommandKind::AuthorizeStart {
                transaction_id,
                limit_kwh,
                ..
            } => {
                assert_eq!(transaction_id, "A");
                assert_eq!(limit_kwh, 30.0);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(h.handle.status(&cp()).unwrap().state, SessionState::Charging);

        h.meter("2", "A", 31.0).await;
        let command = h.next_command().await;
        assert!(matches!(
            command.kind,
            CommandKind::RemoteStop { ref transaction_id, .. } if transaction_id == "A"
        ));
        h.wait_for_state(SessionState::Stopping).await;

        h.stopped("3", "A", 31.0).await;
        let closed = h.wait_for_state(SessionState::Closed).await;
        assert_eq!(closed.stop_reason, Some(StopReason::LimitExceeded));

        let archived = h.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, SessionState::Closed);
        assert_eq!(archived[0].energy_kwh, 31.0);
        assert_eq!(
            archived[0].settlement,
            Some(SettlementOutcome::Captured {
                amount_cents: 1_200,
                energy_kwh: 30.0
            })
        );
    }

    #[tokio::test]
    async fn test_credit_bound_limit_stop_closes() {
        let engine = Arc::new(
            StaticAuthorization::new(40)
                .with_profile(CustomerProfile {
                    credit_limit_cents: 1_000,
                    ..profile("cred3")
                })
                .with_product_cap("basic", 30.0),
        );
        let mut h = start(engine, CoordinatorConfig::default()).await;

        h.start_tx("1", "A", "cred3").await;
        match h.next_command().await.kind {
            CommandKind::AuthorizeStart { limit_kwh, .. } => assert_eq!(limit_kwh, 25.0),
            other => panic!("unexpected command {:?}", other),
        }

        h.meter("2", "A", 25.1).await;
        assert!(matches!(h.next_command().await.kind, CommandKind::RemoteStop { .. }));
        h.stopped("3", "A", 25.1).await;

        let closed = h.wait_for_state(SessionState::Closed).await;
        assert_eq!(closed.stop_reason, Some(StopReason::LimitExceeded));
        assert_eq!(closed.abort_reason, None);

        let archived = h.archived();
        assert_eq!(archived[0].state, SessionState::Closed);
        assert_eq!(
            archived[0].settlement,
            Some(SettlementOutcome::Captured {
                amount_cents: 1_000,
                energy_kwh: 25.0
            })
        );
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_charging() {
        let mut h = start(static_engine(), CoordinatorConfig::default()).await;
        h.start_tx("1", "A", "cred1").await;
        h.next_command().await;

        h.start_tx("2", "B", "cred2").await;
        let command = h.next_command().await;
        assert_eq!(
            command.kind,
            CommandKind::RemoteStop {
                session_id: None,
                transaction_id: "B".into(),
                reason: "another session is open on this station".into(),
            }
        );

        let sessions = h.handle.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Charging);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_processed_once() {
        let mut h = start(static_engine(), CoordinatorConfig::default()).await;
        h.start_tx("1", "A", "cred1").await;
        h.start_tx("1", "A", "cred1").await;

        assert!(matches!(h.next_command().await.kind, CommandKind::AuthorizeStart { .. }));
        h.no_command().await;
    }

    #[tokio::test]
    async fn test_message_ids_reused_after_reconnect() {
        let mut h = start(static_engine(), CoordinatorConfig::default()).await;
        h.start_tx("1", "A", "cred1").await;
        assert!(matches!(h.next_command().await.kind, CommandKind::AuthorizeStart { .. }));
        h.stopped("2", "A", 4.0).await;
        h.wait_for_state(SessionState::Closed).await;

        // station rebooted and counts from 1 again on a new link
        h.send_on(
            "l2",
            "1",
            EventKind::TransactionStarted {
                transaction_id: "B".into(),
                credential: CredentialRef::new("cred2"),
                meter_start_kwh: Some(4.0),
            },
        )
        .await;
        let command = h.next_command().await;
        assert_eq!(command.correlation_id.as_str(), "CS001:l2:1/authorize_start");
        assert!(matches!(
            command.kind,
            CommandKind::AuthorizeStart { ref transaction_id, .. } if transaction_id == "B"
        ));
        assert_eq!(h.handle.status(&cp()).unwrap().state, SessionState::Charging);
    }

    #[tokio::test]
    async fn test_unknown_credential_aborts() {
        let mut h = start(static_engine(), CoordinatorConfig::default()).await;
        h.start_tx("1", "A", "stranger").await;

        assert!(matches!(h.next_command().await.kind, CommandKind::RemoteStop { .. }));
        let status = h.wait_for_state(SessionState::Aborted).await;
        assert_eq!(
            status.abort_reason,
            Some(AbortReason::AuthDenied(DenialReason::UnknownCredential))
        );
        assert_eq!(h.archived().len(), 1);

        // late events for the finished transaction are discarded
        h.stopped("2", "A", 0.0).await;
        h.no_command().await;
        assert_eq!(h.archived().len(), 1);
    }

    #[tokio::test]
    async fn test_authorization_timeout_aborts() {
        let engine = Arc::new(ScriptedEngine {
            decisions: Mutex::new(VecDeque::new()),
            hang: true,
        });
        let config = CoordinatorConfig::default().with_auth_timeout(Duration::from_millis(100));
        let mut h = start(engine, config).await;
        h.start_tx("1", "A", "cred1").await;

        match h.next_command().await.kind {
            CommandKind::RemoteStop { reason, .. } => assert_eq!(reason, "authorization timed out"),
            other => panic!("unexpected command {:?}", other),
        }
        let status = h.wait_for_state(SessionState::Aborted).await;
        assert_eq!(status.abort_reason, Some(AbortReason::AuthTimeout));
    }

    #[tokio::test]
    async fn test_unreachable_engine_aborts() {
        let engine = Arc::new(ScriptedEngine {
            decisions: Mutex::new(VecDeque::new()),
            hang: false,
        });
        let mut h = start(engine, CoordinatorConfig::default()).await;
        h.start_tx("1", "A", "cred1").await;

        assert!(matches!(h.next_command().await.kind, CommandKind::RemoteStop { .. }));
        let status = h.wait_for_state(SessionState::Aborted).await;
        assert_eq!(status.abort_reason, Some(AbortReason::AuthTimeout));
    }

    #[tokio::test]
    async fn test_deferred_decision_is_retried() {
        let engine = Arc::new(ScriptedEngine {
            decisions: Mutex::new(VecDeque::from([
                AuthorizationDecision::Deferred,
                AuthorizationDecision::Approved { limit_kwh: 12.0 },
            ])),
            hang: false,
        });
        let config = CoordinatorConfig::default().with_deferred_retry(Duration::from_millis(20));
        let mut h = start(engine, config).await;
        h.start_tx("1", "A", "cred1").await;

        match h.next_command().await.kind {
            CommandKind::AuthorizeStart { limit_kwh, .. } => assert_eq!(limit_kwh, 12.0),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operator_stop_settles_without_confirmation() {
        let config = CoordinatorConfig::default().with_stop_confirmation_timeout(Duration::from_millis(100));
        let mut h = start(static_engine(), config).await;
        h.start_tx("1", "A", "cred1").await;
        h.next_command().await;
        h.meter("2", "A", 5.0).await;

        h.handle.remote_stop(&cp(), "ops").await.unwrap();
        match h.next_command().await.kind {
            CommandKind::RemoteStop { reason, .. } => assert_eq!(reason, "operator requested"),
            other => panic!("unexpected command {:?}", other),
        }

        let closed = h.wait_for_state(SessionState::Closed).await;
        assert_eq!(closed.stop_reason, Some(StopReason::OperatorRequested));
        assert_eq!(closed.energy_kwh, 5.0);
    }

    #[tokio::test]
    async fn test_heartbeat_loss_stops_session() {
        let config = CoordinatorConfig::default().with_heartbeat_timeout(Duration::from_millis(150));
        let mut h = start(static_engine(), config).await;
        h.start_tx("1", "A", "cred1").await;
        h.next_command().await;

        match h.next_command().await.kind {
            CommandKind::RemoteStop { reason, .. } => assert_eq!(reason, "heartbeat lost"),
            other => panic!("unexpected command {:?}", other),
        }
        let status = h.wait_for_state(SessionState::Stopping).await;
        assert_eq!(status.stop_reason, Some(StopReason::HeartbeatLost));
    }

    /// Archive whose writes stall the calling thread
    struct SlowArchive {
        inner: MemoryArchive,
        delay: Duration,
    }

    impl SessionArchive for SlowArchive {
        fn record(&self, summary: &SessionSummary) -> Result<(), ArchiveError> {
            std::thread::sleep(self.delay);
            self.inner.record(summary)
        }

        fn load_all(&self) -> Result<Vec<SessionSummary>, ArchiveError> {
            self.inner.load_all()
        }
    }

    fn started(station: &ChargePointId, credential: &str) -> DomainEvent {
        DomainEvent::new(
            CorrelationId::from_station_message(station, "l1", "1"),
            station.clone(),
            EventKind::TransactionStarted {
                transaction_id: "A".into(),
                credential: CredentialRef::new(credential),
                meter_start_kwh: Some(0.0),
            },
        )
    }

    async fn next_kind(subscription: &mut Subscription) -> CommandKind {
        let delivery = time::timeout(WAIT, subscription.next()).await.unwrap().unwrap();
        let command = DomainCommand::from_envelope(delivery.envelope()).unwrap();
        delivery.ack();
        command.kind
    }

    #[tokio::test]
    async fn test_slow_archive_does_not_stall_other_stations() {
        let bus = MemoryBus::default();
        let gateway = Gateway::new(Arc::new(bus.clone()), GatewayConfig::default());
        let other = ChargePointId::new("CS002");
        let mut first = bus.subscribe_now(&topics::station_commands(&cp()), "adapter").unwrap();
        let mut second = bus.subscribe_now(&topics::station_commands(&other), "adapter").unwrap();
        let archive = Arc::new(SlowArchive {
            inner: MemoryArchive::new(),
            delay: Duration::from_millis(800),
        });

        let coordinator = Coordinator::new(CoordinatorConfig::default(), gateway.clone(), static_engine(), archive);
        let cancel = CancellationToken::new();
        tokio::spawn(coordinator.run(cancel.clone()));

        let began = std::time::Instant::now();
        gateway.publish_event(&started(&cp(), "stranger")).await.unwrap();
        assert!(matches!(next_kind(&mut first).await, CommandKind::RemoteStop { .. }));

        gateway.publish_event(&started(&other, "cred1")).await.unwrap();
        assert!(matches!(next_kind(&mut second).await, CommandKind::AuthorizeStart { .. }));
        assert!(began.elapsed() < Duration::from_millis(400));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_archive_write() {
        let bus = MemoryBus::default();
        let gateway = Gateway::new(Arc::new(bus.clone()), GatewayConfig::default());
        let mut commands = bus.subscribe_now(&topics::station_commands(&cp()), "adapter").unwrap();
        let archive = Arc::new(SlowArchive {
            inner: MemoryArchive::new(),
            delay: Duration::from_millis(300),
        });

        let coordinator = Coordinator::new(
            CoordinatorConfig::default(),
            gateway.clone(),
            static_engine(),
            archive.clone(),
        );
        let cancel = CancellationToken::new();
        let running = tokio::spawn(coordinator.run(cancel.clone()));

        gateway.publish_event(&started(&cp(), "stranger")).await.unwrap();
        // the archive write follows the stop command
        assert!(matches!(next_kind(&mut commands).await, CommandKind::RemoteStop { .. }));
        cancel.cancel();

        time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        let archived = archive.load_all().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_foreign_shard_events_ignored() {
        let config = CoordinatorConfig::default().with_shard(0, 2);
        let bus = MemoryBus::default();
        let gateway = Gateway::new(Arc::new(bus.clone()), GatewayConfig::default().with_shard_count(2));

        let foreign = (0..100)
            .map(|i| ChargePointId::new(format!("CS{:03}", i)))
            .find(|id| id.shard(2) == 1)
            .unwrap();
        let mut commands = bus.subscribe_now(&topics::station_commands(&foreign), "adapter").unwrap();

        let coordinator = Coordinator::new(config, gateway.clone(), static_engine(), Arc::new(MemoryArchive::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(coordinator.run(cancel.clone()));

        let event = DomainEvent::new(
            CorrelationId::new("x:1"),
            foreign.clone(),
            EventKind::TransactionStarted {
                transaction_id: "A".into(),
                credential: CredentialRef::new("cred1"),
                meter_start_kwh: Some(0.0),
            },
        );
        gateway
            .publish(&topics::station_events(0), event.to_envelope().unwrap())
            .await
            .unwrap();

        assert!(time::timeout(Duration::from_millis(200), commands.next()).await.is_err());
        cancel.cancel();
    }
}
