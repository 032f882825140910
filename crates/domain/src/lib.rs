//! LobbySync Domain
//!
//! Core records and invariants for peer-hosted sessions: the shared session
//! record, its members and properties, and the local connection state
//! vocabulary. No I/O lives here.

pub mod entities;
pub mod error;
pub mod events;
pub mod ids;
pub mod types;
pub mod value_objects;

pub use entities::{MemberRecord, SessionRecord};
pub use error::DomainError;
pub use events::SessionEvent;
pub use ids::{PlayerId, SessionId};
pub use types::{SessionRole, SessionState, StartPhase};
pub use value_objects::{Property, PropertyMap, Visibility};
