// ABOUTME: Transport-agnostic core of the warelay chat relay
// ABOUTME: Provides traits, session persistence, disconnect policy, and pairing helpers

pub mod backoff;
pub mod config;
pub mod disconnect;
pub mod message_store;
pub mod paths;
pub mod phone;
pub mod session;
pub mod traits;
pub mod wire;

// Re-export core traits and types for convenient access
pub use traits::{
    // Seams
    CompletionClient, CredentialStore, Transport,
    // Data Types
    CompletionError, CompletionRequest, ConnectOptions, ConnectionState, EventStream,
    InboundMessage, LoginMode, MessageKey, OutboundReply, TransportEvent,
};

pub use backoff::{BackoffConfig, BackoffState};
pub use disconnect::{DisconnectReason, SupervisorAction};
pub use message_store::MessageStore;
pub use phone::PairingError;
pub use session::{FileCredentialStore, Session, SessionUpdate};
