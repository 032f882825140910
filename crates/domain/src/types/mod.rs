//! Shared vocabulary types

mod session;

pub use session::{SessionRole, SessionState, StartPhase};
