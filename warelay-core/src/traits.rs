// ABOUTME: Core traits for the relay's external collaborators
// ABOUTME: Transport (chat network session), CompletionClient (language model), CredentialStore

use crate::session::{Session, SessionUpdate};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::pin::Pin;
use tokio_stream::Stream;

/// Suffix the chat network uses for group conversation identifiers
pub const GROUP_SUFFIX: &str = "@g.us";

/// Check whether a conversation identifier denotes a group conversation
pub fn is_group_chat(chat_id: &str) -> bool {
    chat_id.ends_with(GROUP_SUFFIX)
}

// =============================================================================
// Message Types
// =============================================================================

/// Addressing information for a single message on the chat network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Conversation identifier (e.g., 111@s.whatsapp.net, 123-456@g.us)
    pub remote_jid: String,
    /// Message ID assigned by the sender
    #[serde(default)]
    pub id: String,
    /// Whether the message was sent by the account this process is logged in as
    #[serde(default)]
    pub from_me: bool,
    /// Author of the message inside a group conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// Incoming message delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub key: MessageKey,
    /// Display name the sender chose for themselves
    pub push_name: Option<String>,
    /// Text payload; None for media, reactions, and other non-text messages
    pub text: Option<String>,
    /// Timestamp in seconds since Unix epoch (0 when the transport omitted it)
    pub timestamp: i64,
}

impl InboundMessage {
    /// Build a plain text message, mostly useful for tests and tooling
    pub fn text(chat_id: impl Into<String>, id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: MessageKey {
                remote_jid: chat_id.into(),
                id: id.into(),
                from_me: false,
                participant: None,
            },
            push_name: None,
            text: Some(text.into()),
            timestamp: 0,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.key.remote_jid
    }

    pub fn is_from_self(&self) -> bool {
        self.key.from_me
    }

    /// The author: the group participant when present, otherwise the chat itself
    pub fn sender(&self) -> &str {
        self.key
            .participant
            .as_deref()
            .unwrap_or(&self.key.remote_jid)
    }

    /// Text payload, treating whitespace-only text the same as no text
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn is_group(&self) -> bool {
        is_group_chat(self.chat_id())
    }
}

/// Reply handed to the transport for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub chat_id: String,
    pub text: String,
    /// The message being replied to, rendered as a quote by the chat client
    pub quoted: MessageKey,
}

impl OutboundReply {
    /// Reply to `message` in the conversation it came from
    pub fn quoting(message: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            chat_id: message.chat_id().to_string(),
            text: text.into(),
            quoted: message.key.clone(),
        }
    }
}

// =============================================================================
// Connection Events
// =============================================================================

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    #[serde(alias = "close")]
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Events delivered by the transport, in the order it observed them
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection status changed. `status_code` is only meaningful on close.
    ConnectionUpdate {
        state: Option<ConnectionState>,
        status_code: Option<u16>,
        /// QR payload to display when logging in with QR mode
        qr: Option<String>,
    },
    /// Credentials rotated; must be persisted before anything else happens
    CredsUpdate(SessionUpdate),
    /// One batch of new messages
    MessagesUpsert(Vec<InboundMessage>),
}

/// How a fresh (unregistered) session gets linked to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// Operator scans a QR code printed on the console
    Qr,
    /// Operator types an 8-character code into the phone app
    PairingCode,
}

/// Options passed to the transport on every connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub login: LoginMode,
    /// Browser identity triple shown in the phone's linked devices list
    pub browser: Vec<String>,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            login: LoginMode::PairingCode,
            browser: vec!["Windows".to_string(), "Firefox".to_string(), String::new()],
            mark_online_on_connect: true,
            sync_full_history: true,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Boxed stream type for transport events
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Messaging transport session. The relay only needs connect, pairing, and send.
///
/// A transport keeps at most one live connection: calling `connect` again tears
/// down whatever the previous call established.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection using the given credentials and return its event stream.
    /// The stream ends after the closing `ConnectionUpdate`.
    async fn connect(&self, session: &Session, options: &ConnectOptions) -> Result<EventStream>;

    /// Ask the chat network for a pairing code for the given normalized phone number
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

    /// Deliver a reply; returns the message ID assigned to it when known
    async fn send_reply(&self, reply: &OutboundReply) -> Result<Option<String>>;

    /// Transport identifier used in logs (e.g., "sidecar")
    fn transport_id(&self) -> &'static str;

    /// Tear down the current connection, if any
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Completion Service
// =============================================================================

/// One chat-completion call: a fixed system turn plus the user's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion API key is not configured")]
    MissingApiKey,

    #[error("completion request failed: {0}")]
    Request(String),

    #[error("completion service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion service returned no text")]
    EmptyResponse,
}

impl CompletionError {
    /// Errors that no amount of retrying will fix and that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompletionError::MissingApiKey)
    }
}

/// Remote text-generation service
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

// =============================================================================
// Credential Store
// =============================================================================

/// Persistence for transport credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the persisted session, or a fresh unregistered one when nothing is stored
    async fn load(&self) -> Result<Session>;

    /// Persist the full session
    async fn save(&self, session: &Session) -> Result<()>;

    /// Delete every persisted credential file, returning how many were removed
    async fn clear(&self) -> Result<usize>;
}
