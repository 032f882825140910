//! LobbySync Player crate.
//!
//! Keeps a local mirror of a remote lobby record in sync, runs the host
//! heartbeat and the start-game handshake, and exposes everything through
//! `SessionManager`. Store, relay and loader are reached through the ports
//! in [`ports::outbound`]; in-process adapters live in
//! [`infrastructure::testing`].

pub mod application;
pub mod infrastructure;
pub mod ports;

// Re-export commonly used entrypoints
pub use application::{
    LobbySettings, LocalIdentity, Session, SessionError, SessionManager, StartHandshake,
    WriteOutcome,
};
pub use infrastructure::{load_dotenv_from_repo_root, EventBus, SessionConfig};
