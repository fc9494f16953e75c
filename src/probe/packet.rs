//! Socket.IO packets over Engine.IO v4 (WebSocket transport)
//!
//! Every WebSocket text frame is one Engine.IO packet: a one-digit type
//! followed by its payload. Socket.IO messages ride inside Engine.IO type
//! `4` with a second digit of their own:
//!
//! ```text
//! 0{"sid":..,"pingInterval":..}   open (server → client)
//! 2 / 3                           ping / pong
//! 40 / 41                         namespace connect / disconnect
//! 42["robotEvent",{..}]           event
//! 44{"message":..}                connect error
//! ```
//!
//! Only the default namespace is used.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SimError};

/// Engine.IO protocol revision sent in the connection query
pub const EIO_VERSION: &str = "4";

/// Engine.IO handshake payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Connect,
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(String),
    /// Acks, binary attachments, other namespaces
    Other,
}

fn malformed(text: &str, reason: impl std::fmt::Display) -> SimError {
    SimError::Connection {
        reason: format!("malformed packet '{}': {}", text, reason),
    }
}

impl Packet {
    pub fn event(name: &str, data: Value) -> Self {
        Packet::Event {
            name: name.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(handshake) => format!("0{}", json!(handshake)),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Connect => "40".to_string(),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, data } => format!("42{}", json!([name, data])),
            Packet::ConnectError(message) => format!("44{}", json!({ "message": message })),
            Packet::Other => "6".to_string(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let Some(kind) = chars.next() else {
            return Err(malformed(text, "empty frame"));
        };
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Packet::Open)
                .map_err(|e| malformed(text, e)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_message(text, rest),
            '5' | '6' => Ok(Packet::Other),
            other => Err(malformed(text, format!("unknown packet type '{}'", other))),
        }
    }
}

/// Socket.IO part of an Engine.IO message packet
fn decode_message(text: &str, body: &str) -> Result<Packet> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Err(malformed(text, "empty message"));
    };
    let rest = chars.as_str();

    // `/ns,` prefix: anything but the default namespace is not ours
    let rest = match rest.strip_prefix('/') {
        Some(namespaced) => match namespaced.split_once(',') {
            Some(("", payload)) => payload,
            Some(_) => return Ok(Packet::Other),
            None if namespaced.is_empty() => "",
            None => return Ok(Packet::Other),
        },
        None => rest,
    };

    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // Optional ack id before the payload
            let payload = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let items: Vec<Value> =
                serde_json::from_str(payload).map_err(|e| malformed(text, e))?;
            let mut items = items.into_iter();
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(malformed(text, "event without a name")),
            };
            Ok(Packet::Event {
                name,
                data: items.next().unwrap_or(Value::Null),
            })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| rest.to_string());
            Ok(Packet::ConnectError(message))
        }
        '3' | '5' | '6' => Ok(Packet::Other),
        other => Err(malformed(text, format!("unknown message type '{}'", other))),
    }
}
