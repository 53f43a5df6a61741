//! Broker wire frames
//!
//! JSON text frames tagged by `op`:
//! - client -> broker: `publish`, `subscribe`, `ack`, `nack`
//! - broker -> client: `published`, `subscribed`, `deliver`, `error`

use moovolt_core::Envelope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish { req: u64, topic: String, envelope: Envelope },
    Subscribe { req: u64, topic: String, group: String },
    Ack { delivery: u64 },
    Nack { delivery: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    Published {
        req: u64,
        sequence: u64,
    },
    Subscribed {
        req: u64,
        subscription: u64,
    },
    Deliver {
        subscription: u64,
        delivery: u64,
        attempt: u32,
        envelope: Envelope,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req: Option<u64>,
        /// Set when a subscribe failed because the group already has a member
        #[serde(default)]
        group_taken: bool,
        message: String,
    },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl BrokerFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn error(req: Option<u64>, message: impl Into<String>) -> Self {
        BrokerFrame::Error {
            req,
            group_taken: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moovolt_core::{ChargePointId, CorrelationId};

    #[test]
    fn test_client_frame_wire_format() {
        let frame = ClientFrame::Subscribe {
            req: 7,
            topic: "station-events.0".into(),
            group: "coordinator".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["req"], 7);
        assert_eq!(json["group"], "coordinator");

        let ack = ClientFrame::parse(r#"{"op":"ack","delivery":3}"#).unwrap();
        assert_eq!(ack, ClientFrame::Ack { delivery: 3 });
    }

    #[test]
    fn test_deliver_frame_carries_envelope() {
        let envelope = Envelope::new(
            CorrelationId::new("CS001:1"),
            ChargePointId::new("CS001"),
            "heartbeat",
            serde_json::json!({"kind": "heartbeat"}),
        )
        .unwrap();
        let frame = BrokerFrame::Deliver {
            subscription: 1,
            delivery: 2,
            attempt: 1,
            envelope: envelope.clone(),
        };

        let parsed = BrokerFrame::parse(&frame.to_text().unwrap()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_error_frame_defaults() {
        let parsed = BrokerFrame::parse(r#"{"op":"error","message":"bad frame"}"#).unwrap();
        assert_eq!(
            parsed,
            BrokerFrame::Error {
                req: None,
                group_taken: false,
                message: "bad frame".into()
            }
        );
    }
}
