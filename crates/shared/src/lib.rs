//! LobbySync Shared - Vocabulary spoken with the remote session store
//!
//! This crate contains the types exchanged between a peer and the session
//! store collaborator:
//! - Request payloads (create, join, update session, update member)
//! - The subscription feed (`StoreNotification`, `SubscriptionState`)
//! - Well-known property keys used by the lobby protocol
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde and the domain crate
//! 2. **No business logic** - Pure data types plus payload helpers
//! 3. **Forward compatible** - Unknown notification kinds deserialize to `Unknown`

pub mod keys;
pub mod notifications;
pub mod requests;

pub use notifications::{StoreNotification, SubscriptionState};
pub use requests::{
    apply_property_update, CreateSessionRequest, JoinSessionRequest, PropertyUpdate,
    UpdateMemberRequest, UpdateSessionRequest,
};
