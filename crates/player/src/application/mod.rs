//! Session application layer.
//!
//! - `Session`: the connection state machine around one remote record
//! - `LocalSession` with the roster and property reconcilers
//! - `HostSession` / `ServerSession`: role-gated capability handles
//! - `StartHandshake` and `LoadGate`: the start-game sequence
//! - `SessionManager`: owner of the current session

pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod host;
pub mod load_gate;
pub mod local_session;
pub mod manager;
pub mod reconcile;
pub mod session;

pub use error::{SessionError, WriteOutcome};
pub use handshake::StartHandshake;
pub use heartbeat::HeartbeatScheduler;
pub use host::{HostSession, ServerSession};
pub use load_gate::LoadGate;
pub use local_session::LocalSession;
pub use manager::{initial_member_properties, LobbySettings, SessionManager};
pub use reconcile::{PropertyReconciler, RosterChanges, RosterReconciler};
pub use session::{LocalIdentity, Session, SessionContext};
