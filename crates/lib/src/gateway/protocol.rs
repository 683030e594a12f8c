//! Gateway wire envelope and in-process gateway events.

use serde::{Deserialize, Serialize};

/// Wire message: `{ "eventName", "data" }`. Every broadcast is wrapped in one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_name: event_name.into(),
            data,
        }
    }

    /// JSON text frame for this envelope.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of one broadcast: how many connections were walked and how many writes failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Events published on the gateway's internal channel (see `BroadcastGateway::subscribe`).
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Transport server created and handlers installed.
    Started,
    /// A connection was tracked; `connections` is the open count afterwards.
    ConnectionOpened { connections: usize },
    /// A tracked connection closed; `connections` is the open count afterwards.
    ConnectionClosed { connections: usize },
    /// A client sent a frame that parsed as an envelope.
    Inbound(Envelope),
    /// An envelope was fanned out.
    Broadcast {
        event_name: String,
        report: BroadcastReport,
    },
    /// The gateway stopped after disconnecting `closed` clients.
    Stopped { closed: usize },
}
