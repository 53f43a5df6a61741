//! Broker node and RemoteBus against each other over a real socket

use std::time::Duration;

use moovolt_broker::{Broker, BrokerConfig, RemoteBus, RemoteBusConfig};
use moovolt_core::bus::{BusConfig, BusError, MessageBus, Subscription};
use moovolt_core::{ChargePointId, CorrelationId, Envelope};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker(cancel: &CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Broker::new(BrokerConfig::default().with_bus(BusConfig::default().with_max_redeliveries(3)));
    tokio::spawn(broker.serve(listener, cancel.clone()));
    format!("ws://{}", addr)
}

async fn client(url: &str, cancel: &CancellationToken) -> RemoteBus {
    let config = RemoteBusConfig::new(url)
        .with_backoff(Duration::from_millis(20), Duration::from_millis(200))
        .with_request_timeout(Duration::from_secs(2));
    RemoteBus::connect(config, cancel.clone()).await.unwrap()
}

fn envelope(id: &str) -> Envelope {
    Envelope::new(
        CorrelationId::new(id),
        ChargePointId::new("CS001"),
        "heartbeat",
        serde_json::json!({"kind": "heartbeat"}),
    )
    .unwrap()
}

async fn next(sub: &mut Subscription) -> moovolt_core::Delivery {
    timeout(WAIT, sub.next()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_publish_and_consume() {
    let cancel = CancellationToken::new();
    let url = start_broker(&cancel).await;
    let bus = client(&url, &cancel).await;

    let mut sub = bus.subscribe("station-events.0", "coordinator").await.unwrap();
    let receipt = bus.publish("station-events.0", envelope("CS001:1")).await.unwrap();
    assert_eq!(receipt.topic, "station-events.0");

    let delivery = next(&mut sub).await;
    assert_eq!(delivery.envelope().correlation_id.as_str(), "CS001:1");
    assert_eq!(delivery.attempt(), 1);
    delivery.ack();

    cancel.cancel();
}

#[tokio::test]
async fn test_retained_until_first_subscriber() {
    let cancel = CancellationToken::new();
    let url = start_broker(&cancel).await;
    let producer = client(&url, &cancel).await;
    let consumer = client(&url, &cancel).await;

    producer.publish("station-commands.CS001", envelope("a")).await.unwrap();
    producer.publish("station-commands.CS001", envelope("b")).await.unwrap();

    let mut sub = consumer.subscribe("station-commands.CS001", "adapter").await.unwrap();
    let first = next(&mut sub).await;
    let second = next(&mut sub).await;
    assert_eq!(first.envelope().correlation_id.as_str(), "a");
    assert_eq!(second.envelope().correlation_id.as_str(), "b");
    first.ack();
    second.ack();

    cancel.cancel();
}

#[tokio::test]
async fn test_nack_redelivers() {
    let cancel = CancellationToken::new();
    let url = start_broker(&cancel).await;
    let bus = client(&url, &cancel).await;

    let mut sub = bus.subscribe("operator.0", "coordinator").await.unwrap();
    bus.publish("operator.0", envelope("op-1")).await.unwrap();

    next(&mut sub).await.nack();
    let again = next(&mut sub).await;
    assert_eq!(again.attempt(), 2);
    assert_eq!(again.envelope().correlation_id.as_str(), "op-1");
    again.ack();

    cancel.cancel();
}

#[tokio::test]
async fn test_group_taken_across_clients() {
    let cancel = CancellationToken::new();
    let url = start_broker(&cancel).await;
    let first = client(&url, &cancel).await;
    let second = client(&url, &cancel).await;

    let _sub = first.subscribe("session-status", "front-end").await.unwrap();
    let err = second.subscribe("session-status", "front-end").await.unwrap_err();
    assert_eq!(
        err,
        BusError::GroupTaken {
            topic: "session-status".into(),
            group: "front-end".into()
        }
    );

    // another group gets its own copy
    assert!(second.subscribe("session-status", "archive").await.is_ok());
    cancel.cancel();
}

#[tokio::test]
async fn test_unacked_delivery_moves_to_next_member() {
    let cancel = CancellationToken::new();
    let url = start_broker(&cancel).await;

    let lost = CancellationToken::new();
    let first = client(&url, &lost).await;
    let mut sub = first.subscribe("station-events.0", "coordinator").await.unwrap();
    first.publish("station-events.0", envelope("CS001:9")).await.unwrap();

    let held = next(&mut sub).await;
    lost.cancel();

    let second = client(&url, &cancel).await;
    let mut sub = loop {
        match second.subscribe("station-events.0", "coordinator").await {
            Ok(sub) => break sub,
            Err(BusError::GroupTaken { .. }) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("subscribe failed: {}", e),
        }
    };

    let redelivered = next(&mut sub).await;
    assert_eq!(redelivered.envelope().correlation_id.as_str(), "CS001:9");
    assert_eq!(redelivered.attempt(), 2);
    redelivered.ack();

    // the stale handle can no longer settle anything
    held.ack();
    cancel.cancel();
}
