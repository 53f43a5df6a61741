//! In-process broker
//!
//! Topics fan out to consumer groups. Each group has at most one live member;
//! messages for a group without a live member wait in the group backlog until
//! someone subscribes again. Messages published before any group exists are
//! retained (bounded) and handed to the first group that subscribes.
//! Group backlogs and the dead-letter list are bounded the same way; the
//! oldest entry gives way.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, error, warn};

use super::{Acker, BusError, Delivery, DeliveryError, DeliveryReceipt, MessageBus, Subscription};
use crate::envelope::Envelope;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Redeliveries after the first attempt before a message is dead-lettered
    pub max_redeliveries: u32,
    /// Messages kept per topic while no group is subscribed
    pub retain_capacity: usize,
    /// Messages parked per group while it has no live member
    pub backlog_capacity: usize,
    /// Dead letters kept for inspection
    pub dead_letter_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 16,
            retain_capacity: 1024,
            backlog_capacity: 4096,
            dead_letter_capacity: 256,
        }
    }
}

impl BusConfig {
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn with_retain_capacity(mut self, capacity: usize) -> Self {
        self.retain_capacity = capacity;
        self
    }

    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }
}

/// Message that exhausted its redeliveries
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub group: String,
    pub envelope: Envelope,
    pub attempts: u32,
}

#[derive(Default)]
struct GroupState {
    tx: Option<mpsc::UnboundedSender<Delivery>>,
    backlog: VecDeque<(Envelope, u32)>,
}

impl GroupState {
    fn is_live(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Default)]
struct TopicState {
    next_sequence: u64,
    groups: HashMap<String, GroupState>,
    retained: VecDeque<Envelope>,
}

struct Inner {
    config: BusConfig,
    topics: Mutex<HashMap<String, TopicState>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl Inner {
    /// Hand a message to a group, or park it in the backlog.
    /// Called with the topic lock held, so a failed send must not drop an armed delivery.
    fn offer(self: &Arc<Self>, topic: &str, group: &str, state: &mut GroupState, envelope: Envelope, attempt: u32) {
        if let Some(tx) = state.tx.as_ref() {
            let acker = MemoryAcker {
                inner: Arc::clone(self),
                topic: topic.to_string(),
                group: group.to_string(),
                envelope: envelope.clone(),
                attempt,
            };
            match tx.send(Delivery::new(envelope, attempt, Box::new(acker))) {
                Ok(()) => return,
                Err(SendError(delivery)) => {
                    let (envelope, attempt) = delivery.disarm();
                    debug!("Bus: {} member of {} gone, parking message", group, topic);
                    state.tx = None;
                    self.park(topic, group, state, envelope, attempt);
                    return;
                }
            }
        }
        self.park(topic, group, state, envelope, attempt);
    }

    fn park(&self, topic: &str, group: &str, state: &mut GroupState, envelope: Envelope, attempt: u32) {
        if state.backlog.len() >= self.config.backlog_capacity {
            if let Some((oldest, _)) = state.backlog.pop_front() {
                warn!(
                    "Bus: backlog of {}/{} full, discarding {} ({})",
                    topic, group, oldest.kind, oldest.correlation_id
                );
            }
        }
        if self.config.backlog_capacity > 0 {
            state.backlog.push_back((envelope, attempt));
        }
    }

    fn redeliver(self: &Arc<Self>, topic: String, group: String, envelope: Envelope, attempt: u32) {
        if attempt > self.config.max_redeliveries {
            error!(
                "Bus: dead-lettering {} ({}) on {}/{} after {} attempts",
                envelope.kind, envelope.correlation_id, topic, group, attempt
            );
            let mut dead_letters = self.dead_letters.lock();
            if dead_letters.len() >= self.config.dead_letter_capacity {
                if let Some(oldest) = dead_letters.pop_front() {
                    warn!(
                        "Bus: dead-letter list full, forgetting {} ({})",
                        oldest.envelope.kind, oldest.envelope.correlation_id
                    );
                }
            }
            if self.config.dead_letter_capacity > 0 {
                dead_letters.push_back(DeadLetter {
                    topic,
                    group,
                    envelope,
                    attempts: attempt,
                });
            }
            return;
        }

        let mut topics = self.topics.lock();
        let Some(state) = topics.get_mut(&topic).and_then(|t| t.groups.get_mut(&group)) else {
            return;
        };
        debug!(
            "Bus: redelivering {} on {}/{} (attempt {})",
            envelope.correlation_id,
            topic,
            group,
            attempt + 1
        );
        self.offer(&topic, &group, state, envelope, attempt + 1);
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    envelope: Envelope,
    attempt: u32,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>) {
        let MemoryAcker {
            inner,
            topic,
            group,
            envelope,
            attempt,
        } = *self;
        inner.redeliver(topic, group, envelope, attempt);
    }
}

/// In-process message bus
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MemoryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish without suspending; the memory bus never fails a publish
    pub fn publish_now(&self, topic: &str, envelope: Envelope) -> DeliveryReceipt {
        let mut topics = self.inner.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.next_sequence += 1;
        let sequence = state.next_sequence;

        if state.groups.is_empty() {
            if state.retained.len() >= self.inner.config.retain_capacity {
                if let Some(oldest) = state.retained.pop_front() {
                    warn!(
                        "Bus: retain buffer of {} full, discarding {} ({})",
                        topic, oldest.kind, oldest.correlation_id
                    );
                }
            }
            if self.inner.config.retain_capacity > 0 {
                state.retained.push_back(envelope);
            }
        } else {
            for (group, group_state) in state.groups.iter_mut() {
                self.inner.offer(topic, group, group_state, envelope.clone(), 1);
            }
        }

        DeliveryReceipt {
            topic: topic.to_string(),
            sequence,
        }
    }

    pub fn subscribe_now(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let mut topics = self.inner.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        let first_group = state.groups.is_empty();
        let group_state = state.groups.entry(group.to_string()).or_default();

        if group_state.is_live() {
            return Err(BusError::GroupTaken {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        group_state.tx = Some(tx);

        let mut pending: VecDeque<(Envelope, u32)> = VecDeque::new();
        if first_group {
            pending.extend(state.retained.drain(..).map(|envelope| (envelope, 1)));
        }
        pending.append(&mut group_state.backlog);

        if !pending.is_empty() {
            debug!("Bus: {} joining {} receives {} queued messages", group, topic, pending.len());
        }
        for (envelope, attempt) in pending {
            self.inner.offer(topic, group, group_state, envelope, attempt);
        }

        Ok(Subscription::new(topic, group, rx))
    }

    /// Messages waiting for a member of `group`
    pub fn backlog(&self, topic: &str, group: &str) -> usize {
        let topics = self.inner.topics.lock();
        topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.backlog.len())
            .unwrap_or(0)
    }

    /// Messages retained on a topic that no group has subscribed to yet
    pub fn retained(&self, topic: &str) -> usize {
        let topics = self.inner.topics.lock();
        topics.get(topic).map(|t| t.retained.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, DeliveryError> {
        Ok(self.publish_now(topic, envelope))
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        self.subscribe_now(topic, group)
    }
}
