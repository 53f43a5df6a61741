//! Retrying publish layer and topic naming

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use super::{BusError, DeliveryError, DeliveryReceipt, MessageBus, Subscription};
use crate::command::{DomainCommand, OperatorRequest};
use crate::envelope::Envelope;
use crate::event::DomainEvent;
use crate::session::SessionStatus;
use crate::types::{ChargePointId, CorrelationId};

/// Topic names shared by both fleets
pub mod topics {
    use crate::types::ChargePointId;

    /// Status updates for the front-end
    pub const SESSION_STATUS: &str = "session-status";

    pub fn station_events(shard: u32) -> String {
        format!("station-events.{}", shard)
    }

    pub fn station_commands(charge_point_id: &ChargePointId) -> String {
        format!("station-commands.{}", charge_point_id)
    }

    pub fn operator(shard: u32) -> String {
        format!("operator.{}", shard)
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Total publish attempts before a `DeliveryError` is surfaced
    pub publish_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Number of coordinator shards; decides the event and operator topics
    pub shard_count: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            publish_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            shard_count: 1,
        }
    }
}

impl GatewayConfig {
    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_shard_count(mut self, shards: u32) -> Self {
        self.shard_count = shards.max(1);
        self
    }
}

/// Typed access to a message bus
#[derive(Clone)]
pub struct Gateway {
    bus: Arc<dyn MessageBus>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(bus: Arc<dyn MessageBus>, config: GatewayConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Publish with exponential backoff and jitter
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, DeliveryError> {
        let mut delay = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.bus.publish(topic, envelope.clone()).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retryable() && attempt < self.config.publish_attempts => {
                    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    warn!(
                        "Gateway: publish of {} to {} failed (attempt {}): {}",
                        envelope.correlation_id, topic, attempt, e
                    );
                    tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                    delay = (delay * 2).min(self.config.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Gateway: giving up on {} ({}) to {} after {} attempts: {}",
                        envelope.kind, envelope.correlation_id, topic, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }

    pub async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        self.bus.subscribe(topic, group).await
    }

    /// Events go to the shard owning the station
    pub async fn publish_event(&self, event: &DomainEvent) -> Result<DeliveryReceipt, DeliveryError> {
        let envelope = event.to_envelope()?;
        let topic = topics::station_events(event.charge_point_id.shard(self.config.shard_count));
        self.publish(&topic, envelope).await
    }

    pub async fn publish_command(&self, command: &DomainCommand) -> Result<DeliveryReceipt, DeliveryError> {
        let envelope = command.to_envelope()?;
        self.publish(&topics::station_commands(&command.charge_point_id), envelope)
            .await
    }

    pub async fn publish_operator(
        &self,
        charge_point_id: &ChargePointId,
        request: &OperatorRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let envelope = request.to_envelope(CorrelationId::generate(), charge_point_id.clone())?;
        let topic = topics::operator(charge_point_id.shard(self.config.shard_count));
        self.publish(&topic, envelope).await
    }

    /// Status update caused by `cause`; one per state reached from that cause
    pub async fn publish_status(
        &self,
        cause: &CorrelationId,
        status: &SessionStatus,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let envelope = Envelope::new(
            cause.derive(&format!("status/{}", status.state)),
            status.charge_point_id.clone(),
            "session_status",
            status,
        )?
        .at(status.updated_at);
        self.publish(topics::SESSION_STATUS, envelope).await
    }
}
