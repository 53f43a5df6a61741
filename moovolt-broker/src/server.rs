//! Broker node
//!
//! Hosts a `MemoryBus` behind WebSocket connections. Every delivery handed to
//! a client is parked in the connection's unacked table until the client
//! acks or nacks it. When a connection ends, its subscriptions are released
//! first and the unacked deliveries are then handed back to the bus, so the
//! next member of the group receives them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use moovolt_core::bus::{BusConfig, BusError, Delivery, MemoryBus, Subscription};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::{BrokerFrame, ClientFrame};
use crate::BrokerError;

/// Broker node configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    pub bus: BusConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5673)),
            bus: BusConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }
}

pub struct Broker {
    config: BrokerConfig,
    bus: MemoryBus,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let bus = MemoryBus::new(config.bus.clone());
        Self { config, bus }
    }

    /// The hosted bus
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), BrokerError> {
        info!("Broker: listening on {}", listener.local_addr()?);
        let mut next_connection = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Broker: shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Broker: accept failed: {}", e);
                            continue;
                        }
                    };
                    next_connection += 1;
                    let id = next_connection;
                    let bus = self.bus.clone();
                    let cancel = cancel.child_token();

                    tokio::spawn(async move {
                        info!("Broker: connection {} from {}", id, peer);
                        match serve_connection(id, bus, stream, cancel).await {
                            Ok(()) => info!("Broker: connection {} closed", id),
                            Err(e) => warn!("Broker: connection {} failed: {}", id, e),
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    id: u64,
    bus: MemoryBus,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<BrokerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    error!("Broker: failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("Broker: write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection::new(id, bus, out_tx);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => connection.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(BrokerError::from(e)),
            },
        }
    };

    connection.close().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    result
}

/// Per-client broker state
struct Connection {
    id: u64,
    bus: MemoryBus,
    out: mpsc::UnboundedSender<BrokerFrame>,
    unacked: Arc<Mutex<HashMap<u64, Delivery>>>,
    next_delivery: Arc<AtomicU64>,
    next_subscription: u64,
    forwarders: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl Connection {
    fn new(id: u64, bus: MemoryBus, out: mpsc::UnboundedSender<BrokerFrame>) -> Self {
        Self {
            id,
            bus,
            out,
            unacked: Arc::new(Mutex::new(HashMap::new())),
            next_delivery: Arc::new(AtomicU64::new(0)),
            next_subscription: 0,
            forwarders: Vec::new(),
            stop: CancellationToken::new(),
        }
    }

    fn send(&self, frame: BrokerFrame) {
        if self.out.send(frame).is_err() {
            debug!("Broker: connection {} writer gone", self.id);
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Broker: connection {} sent a malformed frame: {}", self.id, e);
                self.send(BrokerFrame::error(None, format!("malformed frame: {}", e)));
                return;
            }
        };

        match frame {
            ClientFrame::Publish { req, topic, envelope } => {
                debug!("Broker: {} <- {} ({})", topic, envelope.kind, envelope.correlation_id);
                let receipt = self.bus.publish_now(&topic, envelope);
                self.send(BrokerFrame::Published {
                    req,
                    sequence: receipt.sequence,
                });
            }

            ClientFrame::Subscribe { req, topic, group } => match self.bus.subscribe_now(&topic, &group) {
                Ok(subscription) => {
                    self.next_subscription += 1;
                    let subscription_id = self.next_subscription;
                    info!(
                        "Broker: connection {} joined {} on {} as subscription {}",
                        self.id, group, topic, subscription_id
                    );
                    // Subscribed must reach the client before the first deliver
                    self.send(BrokerFrame::Subscribed {
                        req,
                        subscription: subscription_id,
                    });
                    self.spawn_forwarder(subscription_id, subscription);
                }
                Err(e) => {
                    warn!("Broker: connection {} subscribe refused: {}", self.id, e);
                    self.send(BrokerFrame::Error {
                        req: Some(req),
                        group_taken: matches!(e, BusError::GroupTaken { .. }),
                        message: e.to_string(),
                    });
                }
            },

            ClientFrame::Ack { delivery } => {
                let settled = self.unacked.lock().remove(&delivery);
                match settled {
                    Some(d) => d.ack(),
                    None => debug!("Broker: ack for unknown delivery {}", delivery),
                }
            }

            ClientFrame::Nack { delivery } => {
                let settled = self.unacked.lock().remove(&delivery);
                match settled {
                    Some(d) => d.nack(),
                    None => debug!("Broker: nack for unknown delivery {}", delivery),
                }
            }
        }
    }

    fn spawn_forwarder(&mut self, subscription_id: u64, mut subscription: Subscription) {
        let out = self.out.clone();
        let unacked = Arc::clone(&self.unacked);
        let next_delivery = Arc::clone(&self.next_delivery);
        let stop = self.stop.clone();

        self.forwarders.push(tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = stop.cancelled() => break,
                    delivery = subscription.next() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                let id = next_delivery.fetch_add(1, Ordering::Relaxed) + 1;
                let frame = BrokerFrame::Deliver {
                    subscription: subscription_id,
                    delivery: id,
                    attempt: delivery.attempt(),
                    envelope: delivery.envelope().clone(),
                };
                unacked.lock().insert(id, delivery);
                if out.send(frame).is_err() {
                    break;
                }
            }
        }));
    }

    /// Release subscriptions, then return unacked deliveries to the bus
    async fn close(mut self) {
        self.stop.cancel();
        for forwarder in self.forwarders.drain(..) {
            let _ = forwarder.await;
        }

        let pending: Vec<Delivery> = self.unacked.lock().drain().map(|(_, d)| d).collect();
        if !pending.is_empty() {
            info!(
                "Broker: connection {} left {} unacked deliveries, requeueing",
                self.id,
                pending.len()
            );
        }
        for delivery in pending {
            delivery.nack();
        }
    }
}
