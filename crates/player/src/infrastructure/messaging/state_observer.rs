//! Observable session state.
//!
//! The session owns the state and writes it through a shared atomic; UI code
//! holds a cheap observer and reads it without touching the session.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use lobbysync_domain::SessionState;

/// Shared storage for the current session state.
pub type SharedSessionState = Arc<AtomicU8>;

/// Create shared storage initialized to `SessionState::None`.
pub fn new_shared_state() -> SharedSessionState {
    Arc::new(AtomicU8::new(SessionState::None.to_u8()))
}

/// Internal helper to update the state (used by the session).
pub fn set_session_state(state_ref: &AtomicU8, new_state: SessionState) {
    state_ref.store(new_state.to_u8(), Ordering::SeqCst);
}

/// Observable session state for UI binding.
///
/// Multiple observers can share the same underlying state.
#[derive(Clone)]
pub struct SessionStateObserver {
    state: SharedSessionState,
}

impl SessionStateObserver {
    pub fn new(state: SharedSessionState) -> Self {
        Self { state }
    }

    /// Get the current session state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}
