// ABOUTME: Classification of transport disconnects and the supervisor's transition table
// ABOUTME: Maps raw close status codes to a closed enum, then each reason to restart/logout/halt

use std::fmt;

/// Close status codes used by the chat network
pub mod codes {
    pub const LOGGED_OUT: u16 = 401;
    pub const CONNECTION_LOST: u16 = 408;
    pub const MULTIDEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const RESTART_REQUIRED: u16 = 515;
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    LoggedOut,
    MultideviceMismatch,
    /// Status code outside the known set, or no code at all
    Unknown(Option<u16>),
}

/// What the supervisor does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Re-run the full start sequence (fresh session load, new connection)
    Restart,
    /// Delete persisted credentials and terminate
    LogOut,
    /// Report and stop supervising without retrying
    Halt,
}

impl DisconnectReason {
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(codes::BAD_SESSION) => DisconnectReason::BadSession,
            Some(codes::CONNECTION_CLOSED) => DisconnectReason::ConnectionClosed,
            Some(codes::CONNECTION_LOST) => DisconnectReason::ConnectionLost,
            Some(codes::CONNECTION_REPLACED) => DisconnectReason::ConnectionReplaced,
            Some(codes::RESTART_REQUIRED) => DisconnectReason::RestartRequired,
            Some(codes::LOGGED_OUT) => DisconnectReason::LoggedOut,
            Some(codes::MULTIDEVICE_MISMATCH) => DisconnectReason::MultideviceMismatch,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// The transition table. Exhaustive so a new reason cannot fall through.
    pub fn action(&self) -> SupervisorAction {
        match self {
            DisconnectReason::BadSession
            | DisconnectReason::ConnectionClosed
            | DisconnectReason::ConnectionLost
            | DisconnectReason::ConnectionReplaced
            | DisconnectReason::RestartRequired => SupervisorAction::Restart,
            DisconnectReason::LoggedOut => SupervisorAction::LogOut,
            DisconnectReason::MultideviceMismatch | DisconnectReason::Unknown(_) => {
                SupervisorAction::Halt
            }
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::BadSession => write!(f, "bad session"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::ConnectionReplaced => write!(f, "connection replaced"),
            DisconnectReason::RestartRequired => write!(f, "restart required"),
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::MultideviceMismatch => write!(f, "multidevice mismatch"),
            DisconnectReason::Unknown(Some(code)) => write!(f, "unknown reason ({})", code),
            DisconnectReason::Unknown(None) => write!(f, "unknown reason"),
        }
    }
}
