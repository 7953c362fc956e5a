// ABOUTME: Newline-delimited JSON protocol spoken with the transport sidecar process
// ABOUTME: Commands go out on stdin, events and responses come back on stdout

use crate::session::{Session, SessionUpdate};
use crate::traits::{ConnectOptions, ConnectionState, InboundMessage, MessageKey, TransportEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// =============================================================================
// Outbound (relay -> sidecar)
// =============================================================================

/// One line written to the sidecar's stdin
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarCommand<'a> {
    Connect {
        id: u64,
        session: &'a Session,
        options: &'a ConnectOptions,
    },
    SendMessage {
        id: u64,
        jid: &'a str,
        text: &'a str,
        quoted: &'a MessageKey,
    },
    RequestPairingCode {
        id: u64,
        phone_number: &'a str,
    },
    /// Answer to a `get_message` lookup; `text` of None means not found
    MessageLookup {
        request_id: u64,
        text: Option<String>,
    },
    Shutdown,
}

// =============================================================================
// Inbound (sidecar -> relay)
// =============================================================================

/// One line read from the sidecar's stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarOutput {
    /// Completion of a command that carried an `id`
    Response {
        id: u64,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<ConnectionState>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        qr: Option<String>,
    },
    CredsUpdate {
        #[serde(default)]
        creds: Map<String, Value>,
        #[serde(default)]
        keys: BTreeMap<String, Option<Value>>,
    },
    MessagesUpsert {
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    /// The network asked for a message to re-send during a retry
    GetMessage { request_id: u64, key: MessageKey },
    /// Diagnostic line from the sidecar itself
    Log {
        #[serde(default)]
        level: String,
        message: String,
    },
}

impl SidecarOutput {
    /// Convert to a relay event when this line is one
    pub fn into_event(self) -> Option<TransportEvent> {
        match self {
            SidecarOutput::ConnectionUpdate {
                connection,
                status_code,
                qr,
            } => Some(TransportEvent::ConnectionUpdate {
                state: connection,
                status_code,
                qr,
            }),
            SidecarOutput::CredsUpdate { creds, keys } => {
                Some(TransportEvent::CredsUpdate(SessionUpdate { creds, keys }))
            }
            SidecarOutput::MessagesUpsert { messages } => Some(TransportEvent::MessagesUpsert(
                messages.into_iter().map(InboundMessage::from).collect(),
            )),
            SidecarOutput::Response { .. }
            | SidecarOutput::GetMessage { .. }
            | SidecarOutput::Log { .. } => None,
        }
    }
}

/// Message as the chat network serializes it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<WireContent>,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Seconds since epoch; number, numeric string, or a {low, high} long
    #[serde(default)]
    pub message_timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

/// Batch wrapper matching the network's upsert payload
#[derive(Debug, Clone, Deserialize)]
pub struct WireUpsert {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        Value::Object(obj) => obj.get("low").and_then(Value::as_i64),
        _ => None,
    }
}

impl From<WireMessage> for InboundMessage {
    fn from(wire: WireMessage) -> Self {
        let text = wire.message.and_then(|content| {
            content
                .conversation
                .or_else(|| content.extended_text_message.and_then(|ext| ext.text))
        });
        Self {
            key: wire.key,
            push_name: wire.push_name,
            text,
            timestamp: wire
                .message_timestamp
                .as_ref()
                .and_then(parse_timestamp)
                .unwrap_or(0),
        }
    }
}
