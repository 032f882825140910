//! Messaging infrastructure for session consumers.
//!
//! - `EventBus`: Receive session events (push-based subscription)
//! - `SessionStateObserver`: Read the session state without owning the session

pub mod event_bus;
pub mod state_observer;

pub use event_bus::{EventBus, ListenerId};
pub use state_observer::{
    new_shared_state, set_session_state, SessionStateObserver, SharedSessionState,
};
