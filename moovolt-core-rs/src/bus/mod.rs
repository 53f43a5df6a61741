//! Message bus contract
//!
//! - `memory`: in-process broker with at-least-once delivery
//! - `gateway`: retrying, typed publish layer used by adapters and coordinators
//!
//! Deliveries must be acknowledged. A delivery that is dropped or nacked
//! without an ack goes back to its consumer group and is redelivered, so
//! consumers have to be idempotent on the envelope's correlation id.

pub mod gateway;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

pub use gateway::{topics, Gateway, GatewayConfig};
pub use memory::{BusConfig, MemoryBus};

/// Broker confirmation of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub sequence: u64,
}

/// A message could not be handed to the broker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("bus connection closed")]
    Disconnected,

    #[error("timed out waiting for acknowledgment")]
    Timeout,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl DeliveryError {
    /// Encoding failures never succeed on retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Encoding(_))
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(e: serde_json::Error) -> Self {
        DeliveryError::Encoding(e.to_string())
    }
}

/// Subscription-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("consumer group {group} on {topic} already has a member")]
    GroupTaken { topic: String, group: String },

    #[error("bus connection closed")]
    Disconnected,

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Settles a delivery with whatever broker produced it
pub trait Acker: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// One message handed to a consumer
pub struct Delivery {
    envelope: Envelope,
    attempt: u32,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(envelope: Envelope, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            envelope,
            attempt,
            acker: Some(acker),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// 1 for the first delivery, incremented on each redelivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Hand the message back for redelivery
    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }

    /// Take the message out without settling it
    pub(crate) fn disarm(mut self) -> (Envelope, u32) {
        self.acker = None;
        let envelope = std::mem::replace(&mut self.envelope, empty_envelope());
        (envelope, self.attempt)
    }
}

fn empty_envelope() -> Envelope {
    Envelope {
        correlation_id: crate::types::CorrelationId::new(""),
        charge_point_id: crate::types::ChargePointId::new(""),
        kind: String::new(),
        payload: serde_json::Value::Null,
        timestamp: Default::default(),
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("kind", &self.envelope.kind)
            .field("correlation_id", &self.envelope.correlation_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Consumer side of one (topic, group)
pub struct Subscription {
    topic: String,
    group: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            rx,
        }
    }

    /// Next delivery, `None` once the bus side is gone
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .finish()
    }
}

/// Publish/consume interface over an asynchronous broker
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, DeliveryError>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError>;
}
