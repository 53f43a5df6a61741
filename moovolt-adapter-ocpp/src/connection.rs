//! Station WebSocket connection
//!
//! Owns the one live link to a charging station:
//! - dials `<endpoint>/<station id>` with the OCPP 2.0.1 subprotocol
//! - answers station CALLs and hands the resulting domain events out
//! - sends commands as CALLs and matches CALLRESULT / CALLERROR by message id
//! - reconnects with exponential backoff and replays unanswered commands

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use moovolt_core::bus::DeliveryError;
use moovolt_core::{ChargePointIdentity, CorrelationId, DomainCommand, DomainEvent, EventKind, RegistrationStatus};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::ocpp::messages::*;
use crate::translator::Translator;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

type StationStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type StationSink = SplitSink<StationStream, Message>;

/// Errors on the station link
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid station endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("OCPP error: {0}")]
    Ocpp(#[from] OcppError),
}

/// Station acknowledgment of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub correlation_id: CorrelationId,
    /// The CALLRESULT carried `status: Accepted`
    pub accepted: bool,
}

/// Command waiting for the station's answer
struct Pending {
    call: Call,
    reply: oneshot::Sender<Result<CallResult, CallError>>,
}

struct Shared {
    config: ConnectionConfig,
    url: String,
    identity: Mutex<ChargePointIdentity>,
    translator: Mutex<Translator>,
    /// Unanswered commands by OCPP message id
    outbox: Mutex<HashMap<String, Pending>>,
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Clonable handle for executing commands on the station
#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
    calls: mpsc::UnboundedSender<String>,
}

impl CommandSender {
    /// Execute a command and wait for the station's answer
    pub async fn send_command(&self, command: &DomainCommand) -> Result<CommandAck, DeliveryError> {
        let call = self
            .shared
            .translator
            .lock()
            .command_to_call(command)
            .map_err(|e| DeliveryError::Encoding(e.to_string()))?;
        let message_id = call.message_id.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut outbox = self.shared.outbox.lock();
            if outbox.contains_key(&message_id) {
                return Err(DeliveryError::Rejected(format!("{} already in flight", message_id)));
            }
            outbox.insert(message_id.clone(), Pending { call, reply: reply_tx });
        }

        if self.calls.send(message_id.clone()).is_err() {
            self.shared.outbox.lock().remove(&message_id);
            return Err(DeliveryError::Disconnected);
        }

        match tokio::time::timeout(self.shared.config.command_timeout, reply_rx).await {
            Ok(Ok(Ok(result))) => Ok(CommandAck {
                correlation_id: command.correlation_id.clone(),
                accepted: result.is_accepted(),
            }),
            Ok(Ok(Err(error))) => Err(DeliveryError::Rejected(format!(
                "{:?}: {}",
                error.error_code, error.error_description
            ))),
            Ok(Err(_)) => Err(DeliveryError::Disconnected),
            Err(_) => {
                self.shared.outbox.lock().remove(&message_id);
                Err(DeliveryError::Timeout)
            }
        }
    }
}

/// Live connection to one station
pub struct StationConnection {
    shared: Arc<Shared>,
    commands: CommandSender,
    events: mpsc::UnboundedReceiver<DomainEvent>,
}

impl StationConnection {
    /// Dial the station. The first dial must succeed; afterwards the link is
    /// kept alive in the background until `cancel` fires.
    pub async fn connect(
        identity: ChargePointIdentity,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let url = build_ocpp_url(&identity.endpoint, identity.id.as_str());
        let ws = dial(&url, &config).await?;
        info!("Station {}: connected to {}", identity.id, url);

        let shared = Arc::new(Shared {
            translator: Mutex::new(Translator::new(identity.id.clone(), config.heartbeat_interval)),
            identity: Mutex::new(identity),
            outbox: Mutex::new(HashMap::new()),
            config,
            url,
        });

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_loop(Arc::clone(&shared), ws, calls_rx, events_tx, cancel));

        Ok(Self {
            commands: CommandSender {
                shared: Arc::clone(&shared),
                calls: calls_tx,
            },
            shared,
            events: events_rx,
        })
    }

    /// Next domain event from the station; `None` once the link is shut down
    pub async fn receive_event(&mut self) -> Option<DomainEvent> {
        self.events.recv().await
    }

    /// Execute a command and wait for the station's answer
    pub async fn send_command(&self, command: &DomainCommand) -> Result<CommandAck, DeliveryError> {
        self.commands.send_command(command).await
    }

    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    /// Current view of the station's registration
    pub fn identity(&self) -> ChargePointIdentity {
        self.shared.identity.lock().clone()
    }

    /// Commands sent but not yet answered
    pub fn outstanding(&self) -> usize {
        self.shared.outbox.lock().len()
    }
}

async fn dial(url: &str, config: &ConnectionConfig) -> Result<StationStream, ConnectionError> {
    let mut request = url
        .into_client_request()
        .map_err(|_| ConnectionError::InvalidEndpoint(url.to_string()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    };

    let (ws, response) = connect_async_with_config(request, Some(ws_config), false).await?;

    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "Station at {} did not accept OCPP 2.0.1 subprotocol, got: {:?}",
            url, accepted_protocol
        );
    }

    Ok(ws)
}

/// How a link ended without a transport error
enum LinkEnd {
    /// Cancelled, or every command sender is gone
    Stopped,
    /// Station closed the socket
    Closed,
}

/// Keep the station link alive until cancelled
async fn connection_loop(
    shared: Arc<Shared>,
    mut ws: StationStream,
    mut calls: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<DomainEvent>,
    cancel: CancellationToken,
) {
    let station = shared.identity.lock().id.clone();

    loop {
        match run_link(&shared, ws, &mut calls, &events, &cancel).await {
            Ok(LinkEnd::Stopped) => break,
            Ok(LinkEnd::Closed) => warn!("Station {}: connection closed by station", station),
            Err(e) => error!("Station {}: connection error: {}", station, e),
        }
        if cancel.is_cancelled() {
            break;
        }

        // One outage, one event
        shared.identity.lock().suspend();
        let link = shared.translator.lock().link().to_string();
        let outage = CorrelationId::from_station_message(&station, &link, "disconnected");
        let _ = events.send(DomainEvent::new(outage, station.clone(), EventKind::StationDisconnected));

        let mut delay = shared.config.reconnect_delay;
        ws = loop {
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            info!("Station {}: reconnecting in {:?}", station, delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    shared.outbox.lock().clear();
                    return;
                }
                _ = tokio::time::sleep(delay + std::time::Duration::from_millis(jitter_ms)) => {}
            }

            match dial(&shared.url, &shared.config).await {
                Ok(ws) => break ws,
                Err(e) => {
                    warn!("Station {}: reconnect failed: {}", station, e);
                    delay = std::cmp::min(delay * 2, shared.config.max_reconnect_delay);
                }
            }
        };

        {
            let mut identity = shared.identity.lock();
            if identity.status == RegistrationStatus::Suspended {
                identity.activate();
            }
        }
        shared.translator.lock().start_link();
        info!("Station {}: reconnected to {}", station, shared.url);
    }

    info!("Station {}: connection stopped", station);
    // Waiting commands see the reply channel close
    shared.outbox.lock().clear();
}

/// Pump one WebSocket link until it ends
async fn run_link(
    shared: &Arc<Shared>,
    ws: StationStream,
    calls: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<DomainEvent>,
    cancel: &CancellationToken,
) -> Result<LinkEnd, ConnectionError> {
    let (mut sink, mut source) = ws.split();
    let mut sent: HashSet<String> = HashSet::new();

    // Commands the previous link never got an answer for
    let replay: Vec<Call> = shared.outbox.lock().values().map(|p| p.call.clone()).collect();
    if !replay.is_empty() {
        info!("Station link: replaying {} unanswered commands", replay.len());
    }
    for call in replay {
        sent.insert(call.message_id.clone());
        send(&mut sink, &OcppMessage::Call(call)).await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(LinkEnd::Stopped);
            }

            message_id = calls.recv() => {
                let Some(message_id) = message_id else {
                    let _ = sink.close().await;
                    return Ok(LinkEnd::Stopped);
                };
                if !sent.insert(message_id.clone()) {
                    continue;
                }
                let call = shared.outbox.lock().get(&message_id).map(|p| p.call.clone());
                match call {
                    Some(call) => send(&mut sink, &OcppMessage::Call(call)).await?,
                    None => debug!("Station link: {} timed out before it was sent", message_id),
                }
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!("Station link: <- {}", text);
                    handle_text(shared, &mut sink, events, text.as_bytes()).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(LinkEnd::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

async fn handle_text(
    shared: &Arc<Shared>,
    sink: &mut StationSink,
    events: &mpsc::UnboundedSender<DomainEvent>,
    bytes: &[u8],
) -> Result<(), ConnectionError> {
    match OcppMessage::parse(bytes) {
        Ok(OcppMessage::Call(call)) => {
            let translation = shared.translator.lock().handle_call(&call);
            if let Some(event) = translation.event {
                if matches!(event.kind, EventKind::StationRegistered { .. }) {
                    shared.identity.lock().activate();
                }
                let _ = events.send(event);
            }
            send(sink, &translation.response).await?;
        }

        Ok(OcppMessage::CallResult(result)) => {
            let pending = shared.outbox.lock().remove(&result.message_id);
            match pending {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(result));
                }
                None => debug!("Station link: CALLRESULT for unknown {}", result.message_id),
            }
        }

        Ok(OcppMessage::CallError(error)) => {
            let pending = shared.outbox.lock().remove(&error.message_id);
            match pending {
                Some(pending) => {
                    let _ = pending.reply.send(Err(error));
                }
                None => debug!("Station link: CALLERROR for unknown {}", error.message_id),
            }
        }

        Err(OcppError::UnknownAction(action)) => {
            if let Some(message_id) = OcppMessage::recover_call_id(bytes) {
                warn!("Station link: unsupported action {}", action);
                let reply = CallError::new(message_id, ErrorCode::NotImplemented, format!("{} is not implemented", action));
                send(sink, &OcppMessage::CallError(reply)).await?;
            }
        }

        Err(e) => match OcppMessage::recover_call_id(bytes) {
            Some(message_id) => {
                warn!("Station link: malformed CALL {}: {}", message_id, e);
                let reply = CallError::new(message_id, ErrorCode::FormatViolation, e.to_string());
                send(sink, &OcppMessage::CallError(reply)).await?;
            }
            None => warn!("Station link: dropping unparseable frame: {}", e),
        },
    }
    Ok(())
}

async fn send(sink: &mut StationSink, message: &OcppMessage) -> Result<(), ConnectionError> {
    let text = message.to_text()?;
    debug!("Station link: -> {}", text);
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
