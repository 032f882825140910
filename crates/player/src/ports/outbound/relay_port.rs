//! Relay Port - allocates and consumes the network endpoint of a started game
//!
//! Allocation internals are out of scope; the engine only needs a join code
//! on the host side and a way to consume it on clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay allocation failed: {0}")]
    AllocationFailed(String),
    #[error("Invalid join code: {0}")]
    InvalidJoinCode(String),
    #[error("Relay unavailable")]
    Unavailable,
}

/// Endpoint published by the host for clients to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEndpoint {
    pub join_code: String,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RelayPort: Send + Sync {
    /// Allocate an endpoint for up to `max_players` connections.
    async fn allocate(&self, max_players: u32) -> Result<JoinEndpoint, RelayError>;

    /// Consume a join code published by a host.
    async fn join(&self, join_code: &str) -> Result<(), RelayError>;
}
