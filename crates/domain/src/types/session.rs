//! Session-related domain types
//!
//! Connection state of the local view, the role the local process plays in a
//! session, and the phases of the start-game handshake.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection state of the local session view.
///
/// `None -> Connected -> {Disconnected, Deleted}`, `Disconnected -> Connected`
/// (reconnect) or `Disconnected -> Deleted`. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    /// Not yet attached to a session record
    #[default]
    None,
    /// Attached and receiving change notifications
    Connected,
    /// Detached; may reconnect unless the record is gone
    Disconnected,
    /// The backing record no longer exists
    Deleted,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed (it is a no-op).
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (None, Connected)
                | (Connected, Disconnected)
                | (Connected, Deleted)
                | (Disconnected, Connected)
                | (Disconnected, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Deleted)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            SessionState::None => 0,
            SessionState::Connected => 1,
            SessionState::Disconnected => 2,
            SessionState::Deleted => 3,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connected,
            2 => SessionState::Disconnected,
            3 => SessionState::Deleted,
            _ => SessionState::None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::None => write!(f, "None"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Role of the local process in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionRole {
    /// A member that currently holds the host id
    Host,
    /// Any other member
    #[default]
    Client,
    /// A dedicated server that hosts the record without being a member
    Server,
}

impl SessionRole {
    /// Host and Server both carry host privileges.
    pub fn has_host_privileges(&self) -> bool {
        matches!(self, SessionRole::Host | SessionRole::Server)
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Host => write!(f, "Host"),
            SessionRole::Client => write!(f, "Client"),
            SessionRole::Server => write!(f, "Server"),
        }
    }
}

/// Phases of the start-game handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartPhase {
    /// Nothing started yet
    #[default]
    Idle,
    /// Client saw the `started` marker but no join code yet
    AwaitingEndpoint,
    /// Client is consuming the join code while the shared load runs gated
    Joining { join_code: String },
    /// Shared load is running; activation waits for the threshold (and the
    /// confirmation, on clients)
    Loading { confirmed: bool },
    /// Shared resource activated
    Active,
    /// Handshake gave up; the load was aborted
    Aborted { reason: String },
}

impl StartPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StartPhase::Active | StartPhase::Aborted { .. })
    }
}
