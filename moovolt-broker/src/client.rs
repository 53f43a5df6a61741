//! Broker client
//!
//! `RemoteBus` implements `MessageBus` over one WebSocket connection to a
//! broker node:
//! - publish and subscribe wait for the broker's answer (with a timeout)
//! - on connection loss the client reconnects with exponential backoff and
//!   re-subscribes every live subscription under the same consumer group
//! - deliveries the client never acked are redelivered by the broker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use moovolt_core::bus::{Acker, BusError, Delivery, DeliveryError, DeliveryReceipt, MessageBus, Subscription};
use moovolt_core::Envelope;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::{BrokerFrame, ClientFrame};
use crate::BrokerError;

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct RemoteBusConfig {
    /// Broker URL, e.g. `ws://localhost:5673`
    pub url: String,
    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Time to wait for the broker to answer a publish or subscribe
    pub request_timeout: Duration,
}

impl Default for RemoteBusConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5673".to_string(),
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RemoteBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Someone waiting for the broker to answer a request
enum Waiter {
    Publish(oneshot::Sender<Result<u64, DeliveryError>>),
    /// `reply` is `None` for re-subscriptions after a reconnect
    Subscribe {
        local: u64,
        reply: Option<oneshot::Sender<Result<(), BusError>>>,
    },
}

struct LocalSubscription {
    topic: String,
    group: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    /// Writer of the current connection, `None` while disconnected
    outgoing: Option<mpsc::UnboundedSender<ClientFrame>>,
    waiters: HashMap<u64, Waiter>,
    subscriptions: HashMap<u64, LocalSubscription>,
    /// Broker subscription id -> local subscription id, per connection
    routes: HashMap<u64, u64>,
}

struct Inner {
    config: RemoteBusConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Ask the broker to (re)attach a local subscription
    fn resubscribe(&self, local: u64) {
        let mut state = self.state.lock();
        let Some(out) = state.outgoing.clone() else {
            return;
        };
        let Some(sub) = state.subscriptions.get(&local) else {
            return;
        };
        let req = self.next_id();
        let frame = ClientFrame::Subscribe {
            req,
            topic: sub.topic.clone(),
            group: sub.group.clone(),
        };
        state.waiters.insert(req, Waiter::Subscribe { local, reply: None });
        if out.send(frame).is_err() {
            state.waiters.remove(&req);
        }
    }

    /// Fail everything in flight after the connection dropped
    fn disconnected(&self) {
        let mut state = self.state.lock();
        state.outgoing = None;
        state.routes.clear();
        let waiters: Vec<Waiter> = state.waiters.drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            match waiter {
                Waiter::Publish(tx) => {
                    let _ = tx.send(Err(DeliveryError::Disconnected));
                }
                Waiter::Subscribe { local, reply: Some(tx) } => {
                    state.subscriptions.remove(&local);
                    let _ = tx.send(Err(BusError::Disconnected));
                }
                Waiter::Subscribe { reply: None, .. } => {}
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: BrokerFrame) {
        match frame {
            BrokerFrame::Published { req, sequence } => {
                let waiter = self.state.lock().waiters.remove(&req);
                if let Some(Waiter::Publish(tx)) = waiter {
                    let _ = tx.send(Ok(sequence));
                }
            }

            BrokerFrame::Subscribed { req, subscription } => {
                let mut state = self.state.lock();
                let Some(Waiter::Subscribe { local, reply }) = state.waiters.remove(&req) else {
                    return;
                };
                if state.subscriptions.contains_key(&local) {
                    state.routes.insert(subscription, local);
                } else {
                    debug!("Broker client: subscription {} confirmed after consumer left", local);
                }
                if let Some(tx) = reply {
                    let _ = tx.send(Ok(()));
                }
            }

            BrokerFrame::Deliver {
                subscription,
                delivery,
                attempt,
                envelope,
            } => self.deliver(subscription, delivery, attempt, envelope),

            BrokerFrame::Error {
                req: Some(req),
                group_taken,
                message,
            } => {
                let mut state = self.state.lock();
                match state.waiters.remove(&req) {
                    Some(Waiter::Publish(tx)) => {
                        let _ = tx.send(Err(DeliveryError::Rejected(message)));
                    }
                    Some(Waiter::Subscribe { local, reply: Some(tx) }) => {
                        let error = match state.subscriptions.remove(&local) {
                            Some(sub) if group_taken => BusError::GroupTaken {
                                topic: sub.topic,
                                group: sub.group,
                            },
                            _ => BusError::Rejected(message),
                        };
                        let _ = tx.send(Err(error));
                    }
                    Some(Waiter::Subscribe { local, reply: None }) => {
                        // Broker has not released our previous membership yet
                        warn!("Broker client: re-subscribe of {} refused: {}", local, message);
                        let inner = Arc::clone(self);
                        let delay = self.config.reconnect_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            inner.resubscribe(local);
                        });
                    }
                    None => debug!("Broker client: error for unknown request {}", req),
                }
            }

            BrokerFrame::Error {
                req: None, message, ..
            } => warn!("Broker client: broker reported: {}", message),
        }
    }

    fn deliver(&self, subscription: u64, delivery: u64, attempt: u32, envelope: Envelope) {
        let mut state = self.state.lock();
        let Some(out) = state.outgoing.clone() else {
            return;
        };

        let Some(local) = state.routes.get(&subscription).copied() else {
            debug!("Broker client: delivery {} for unknown subscription {}", delivery, subscription);
            let _ = out.send(ClientFrame::Nack { delivery });
            return;
        };

        let message = Delivery::new(envelope, attempt, Box::new(RemoteAcker { delivery, out }));
        let rejected = match state.subscriptions.get(&local) {
            Some(sub) => sub.tx.send(message).err().map(|e| e.0),
            None => Some(message),
        };

        if rejected.is_some() {
            debug!("Broker client: consumer of subscription {} is gone", local);
            state.subscriptions.remove(&local);
            state.routes.remove(&subscription);
        }
        drop(state);
        // Nacks on drop
        drop(rejected);
    }
}

struct RemoteAcker {
    delivery: u64,
    out: mpsc::UnboundedSender<ClientFrame>,
}

impl Acker for RemoteAcker {
    fn ack(self: Box<Self>) {
        let _ = self.out.send(ClientFrame::Ack {
            delivery: self.delivery,
        });
    }

    fn nack(self: Box<Self>) {
        let _ = self.out.send(ClientFrame::Nack {
            delivery: self.delivery,
        });
    }
}

/// `MessageBus` backed by a broker node
#[derive(Clone)]
pub struct RemoteBus {
    inner: Arc<Inner>,
}

impl RemoteBus {
    /// Dial the broker. The first dial must succeed; afterwards the
    /// connection is kept alive in the background until `cancel` fires.
    pub async fn connect(config: RemoteBusConfig, cancel: CancellationToken) -> Result<Self, BrokerError> {
        let ws = dial(&config.url).await?;
        info!("Broker client: connected to {}", config.url);

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(0),
        });

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        inner.state.lock().outgoing = Some(out_tx);
        tokio::spawn(connection_loop(Arc::clone(&inner), ws, out_rx, cancel));

        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().outgoing.is_some()
    }

    fn send(&self, frame: ClientFrame, req: u64, waiter: Waiter) -> bool {
        let mut state = self.inner.state.lock();
        let Some(out) = state.outgoing.clone() else {
            return false;
        };
        state.waiters.insert(req, waiter);
        if out.send(frame).is_err() {
            state.waiters.remove(&req);
            return false;
        }
        true
    }
}

#[async_trait]
impl MessageBus for RemoteBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, DeliveryError> {
        let req = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        let frame = ClientFrame::Publish {
            req,
            topic: topic.to_string(),
            envelope,
        };
        if !self.send(frame, req, Waiter::Publish(tx)) {
            return Err(DeliveryError::Disconnected);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result.map(|sequence| DeliveryReceipt {
                topic: topic.to_string(),
                sequence,
            }),
            Ok(Err(_)) => Err(DeliveryError::Disconnected),
            Err(_) => {
                self.inner.state.lock().waiters.remove(&req);
                Err(DeliveryError::Timeout)
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let local = self.inner.next_id();
        let req = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().subscriptions.insert(
            local,
            LocalSubscription {
                topic: topic.to_string(),
                group: group.to_string(),
                tx,
            },
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = ClientFrame::Subscribe {
            req,
            topic: topic.to_string(),
            group: group.to_string(),
        };
        let waiter = Waiter::Subscribe {
            local,
            reply: Some(reply_tx),
        };
        if !self.send(frame, req, waiter) {
            self.inner.state.lock().subscriptions.remove(&local);
            return Err(BusError::Disconnected);
        }

        let result = match tokio::time::timeout(self.inner.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                self.inner.state.lock().waiters.remove(&req);
                Err(BusError::Rejected("broker did not answer subscribe".into()))
            }
        };

        match result {
            Ok(()) => {
                debug!("Broker client: subscribed to {} as {}", topic, group);
                Ok(Subscription::new(topic, group, rx))
            }
            Err(e) => {
                self.inner.state.lock().subscriptions.remove(&local);
                Err(e)
            }
        }
    }
}

async fn dial(url: &str) -> Result<BrokerStream, BrokerError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

/// Keep a broker connection alive until cancelled
async fn connection_loop(
    inner: Arc<Inner>,
    mut ws: BrokerStream,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    cancel: CancellationToken,
) {
    loop {
        match run_session(&inner, ws, out_rx, &cancel).await {
            Ok(()) => info!("Broker client: connection to {} closed", inner.config.url),
            Err(e) => error!("Broker client: connection to {} failed: {}", inner.config.url, e),
        }
        inner.disconnected();

        if cancel.is_cancelled() {
            return;
        }

        let mut delay = inner.config.reconnect_delay;
        ws = loop {
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            info!("Broker client: reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay + Duration::from_millis(jitter_ms)) => {}
            }

            match dial(&inner.config.url).await {
                Ok(ws) => break ws,
                Err(e) => {
                    warn!("Broker client: reconnect to {} failed: {}", inner.config.url, e);
                    delay = std::cmp::min(delay * 2, inner.config.max_reconnect_delay);
                }
            }
        };

        info!("Broker client: reconnected to {}", inner.config.url);
        let (out_tx, rx) = mpsc::unbounded_channel();
        out_rx = rx;
        let locals: Vec<u64> = {
            let mut state = inner.state.lock();
            state.outgoing = Some(out_tx);
            state.subscriptions.keys().copied().collect()
        };
        for local in locals {
            inner.resubscribe(local);
        }
    }
}

/// Pump one connection until it ends
async fn run_session(
    inner: &Arc<Inner>,
    ws: BrokerStream,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(());
            }

            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Broker client: failed to encode frame: {}", e);
                        continue;
                    }
                };
                sink.send(Message::Text(text.into())).await?;
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => match BrokerFrame::parse(&text) {
                    Ok(frame) => inner.handle_frame(frame),
                    Err(e) => warn!("Broker client: unparseable frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
