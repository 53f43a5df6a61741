//! Adapter against a local WebSocket station speaking OCPP 2.0.1

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use moovolt_adapter_ocpp::{Adapter, AdapterConfig, ConnectionConfig, OCPP_SUBPROTOCOL};
use moovolt_core::bus::BusConfig;
use moovolt_core::{
    topics, ChargePointId, CommandKind, CorrelationId, DomainCommand, Envelope, Gateway, GatewayConfig, MemoryBus,
    Subscription,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Test double for a charging station
struct Station {
    ws: WebSocketStream<TcpStream>,
    path: String,
    protocol: Option<String>,
}

impl Station {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut seen = (String::new(), None);
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                seen.0 = req.uri().path().to_string();
                seen.1 = req
                    .headers()
                    .get(header::SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
                Ok(resp)
            },
        )
        .await
        .unwrap();

        Self {
            ws,
            path: seen.0,
            protocol: seen.1,
        }
    }

    async fn send(&mut self, frame: Value) {
        self.ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        loop {
            let msg = timeout(WAIT, self.ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Send a CALL and return the adapter's answer
    async fn call(&mut self, id: &str, action: &str, payload: Value) -> Value {
        self.send(json!([2, id, action, payload])).await;
        let reply = self.recv().await;
        assert_eq!(reply[1], id);
        reply
    }

    async fn boot(&mut self) {
        let reply = self
            .call(
                "boot-1",
                "BootNotification",
                json!({"chargingStation": {"model": "MV-22", "vendorName": "Moovolt"}, "reason": "PowerUp"}),
            )
            .await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[2]["status"], "Accepted");
    }
}

struct Setup {
    listener: TcpListener,
    bus: Arc<MemoryBus>,
    gateway: Gateway,
    events: Subscription,
    cancel: CancellationToken,
}

impl Drop for Setup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn setup() -> Setup {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ocpp", listener.local_addr().unwrap());

    let bus = Arc::new(MemoryBus::new(BusConfig::default()));
    let gateway = Gateway::new(bus.clone(), GatewayConfig::default());
    let events = bus.subscribe_now(&topics::station_events(0), "coordinator").unwrap();

    let config = AdapterConfig::new("CS001", endpoint).with_connection(
        ConnectionConfig::default()
            .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
            .with_command_timeout(Duration::from_secs(3)),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(Adapter::new(config, gateway.clone()).run(cancel.clone()));

    Setup {
        listener,
        bus,
        gateway,
        events,
        cancel,
    }
}

async fn next_event(sub: &mut Subscription) -> Envelope {
    let delivery = timeout(WAIT, sub.next()).await.unwrap().unwrap();
    let envelope = delivery.envelope().clone();
    delivery.ack();
    envelope
}

fn remote_stop(correlation: &str, tx: &str) -> DomainCommand {
    DomainCommand::new(
        CorrelationId::new(correlation),
        ChargePointId::new("CS001"),
        CommandKind::RemoteStop {
            session_id: None,
            transaction_id: tx.into(),
            reason: "energy limit reached".into(),
        },
    )
}

#[tokio::test]
async fn test_station_traffic_becomes_events() {
    let mut setup = setup().await;
    let mut station = Station::accept(&setup.listener).await;
    assert_eq!(station.path, "/ocpp/CS001");
    assert_eq!(station.protocol.as_deref(), Some(OCPP_SUBPROTOCOL));

    station.boot().await;
    let event = next_event(&mut setup.events).await;
    assert_eq!(event.kind, "station_registered");
    assert!(event.correlation_id.as_str().starts_with("CS001:"));
    assert!(event.correlation_id.as_str().ends_with(":boot-1"));

    let reply = station
        .call(
            "tx-start",
            "TransactionEvent",
            json!({
                "eventType": "Started",
                "timestamp": "2026-01-20T12:00:00Z",
                "triggerReason": "Authorized",
                "seqNo": 0,
                "transactionInfo": {"transactionId": "tx-1"},
                "idToken": {"idToken": "TAG1", "type": "ISO14443"},
                "evse": {"id": 1},
                "meterValue": [{
                    "timestamp": "2026-01-20T12:00:00Z",
                    "sampledValue": [{"value": 2.5, "unitOfMeasure": {"unit": "kWh"}}]
                }]
            }),
        )
        .await;
    assert_eq!(reply[0], 3);

    let event = next_event(&mut setup.events).await;
    assert_eq!(event.kind, "transaction_started");
    assert_eq!(event.payload["credential"], "TAG1");
    assert_eq!(event.payload["meter_start_kwh"], 2.5);

    let reply = station.call("res-1", "ReserveNow", json!({})).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "NotImplemented");

    let reply = station.call("bad-1", "TransactionEvent", json!({"eventType": "Started"})).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "FormatViolation");

    let reply = station.call("hb-1", "Heartbeat", json!({})).await;
    assert!(reply[2]["currentTime"].is_string());
    let event = next_event(&mut setup.events).await;
    assert_eq!(event.kind, "heartbeat");
}

#[tokio::test]
async fn test_command_executed_once() {
    let setup = setup().await;
    let mut station = Station::accept(&setup.listener).await;
    station.boot().await;

    setup.gateway.publish_command(&remote_stop("CS001:m7/remote_stop", "tx-1")).await.unwrap();
    let call = station.recv().await;
    assert_eq!(call[0], 2);
    assert_eq!(call[1], "CS001:m7/remote_stop");
    assert_eq!(call[2], "RequestStopTransaction");
    assert_eq!(call[3]["transactionId"], "tx-1");
    station.send(json!([3, "CS001:m7/remote_stop", {"status": "Accepted"}])).await;

    // redelivered copy is acked without reaching the station
    setup.gateway.publish_command(&remote_stop("CS001:m7/remote_stop", "tx-1")).await.unwrap();
    setup.gateway.publish_command(&remote_stop("CS001:m8/remote_stop", "tx-2")).await.unwrap();

    let call = station.recv().await;
    assert_eq!(call[1], "CS001:m8/remote_stop");
    station.send(json!([3, "CS001:m8/remote_stop", {"status": "Rejected"}])).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let commands = topics::station_commands(&ChargePointId::new("CS001"));
    assert_eq!(setup.bus.backlog(&commands, "adapter"), 0);
    assert!(setup.bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_unanswered_command_replayed_after_reconnect() {
    let mut setup = setup().await;
    let mut station = Station::accept(&setup.listener).await;
    station.boot().await;
    let first_boot = next_event(&mut setup.events).await;
    assert_eq!(first_boot.kind, "station_registered");

    setup.gateway.publish_command(&remote_stop("CS001:m9/remote_stop", "tx-1")).await.unwrap();
    let call = station.recv().await;
    assert_eq!(call[1], "CS001:m9/remote_stop");

    // link drops before the station answers
    station.ws.close(None).await.unwrap();
    drop(station);

    let event = next_event(&mut setup.events).await;
    assert_eq!(event.kind, "station_disconnected");

    let mut station = Station::accept(&setup.listener).await;
    let call = station.recv().await;
    assert_eq!(call[1], "CS001:m9/remote_stop");
    assert_eq!(call[2], "RequestStopTransaction");
    station.send(json!([3, "CS001:m9/remote_stop", {"status": "Accepted"}])).await;

    // station restarted its message counter on the new link
    station.boot().await;
    let second_boot = next_event(&mut setup.events).await;
    assert_eq!(second_boot.kind, "station_registered");
    assert_ne!(second_boot.correlation_id, first_boot.correlation_id);

    station.call("hb-2", "Heartbeat", json!({})).await;
    // one outage, one disconnect event
    let event = next_event(&mut setup.events).await;
    assert_eq!(event.kind, "heartbeat");
    assert!(event.correlation_id.as_str().ends_with(":hb-2"));
}

#[tokio::test]
async fn test_long_correlation_id_sent_as_short_message_id() {
    let setup = setup().await;
    let mut station = Station::accept(&setup.listener).await;
    station.boot().await;

    let correlation = "CS001:5f0c2a1e:3b2d9c1e-0c1a-4f7e-9a51-0d5a4c7e2b11/remote_stop";
    setup.gateway.publish_command(&remote_stop(correlation, "tx-1")).await.unwrap();
    let call = station.recv().await;
    let message_id = call[1].as_str().unwrap().to_string();
    assert!(message_id.len() <= 36);
    assert_eq!(call[2], "RequestStopTransaction");
    station.send(json!([3, message_id, {"status": "Accepted"}])).await;

    // redelivery is recognised by correlation id and not re-sent
    setup.gateway.publish_command(&remote_stop(correlation, "tx-1")).await.unwrap();
    assert!(timeout(Duration::from_millis(300), station.ws.next()).await.is_err());

    let commands = topics::station_commands(&ChargePointId::new("CS001"));
    assert_eq!(setup.bus.backlog(&commands, "adapter"), 0);
}
