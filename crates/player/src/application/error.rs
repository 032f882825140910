//! Errors surfaced by session operations.

use lobbysync_domain::{DomainError, SessionId};

use crate::ports::outbound::{LoadError, RelayError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The caller is not allowed to do this in the current session state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// The backing record no longer exists
    #[error("Session {0} was deleted")]
    SessionDeleted(SessionId),
    /// A host-only action was attempted without host privileges
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Session store error: {0}")]
    Transport(#[from] StoreError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Resource load error: {0}")]
    Load(#[from] LoadError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl SessionError {
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Failures of the remote call itself, as opposed to usage errors.
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Relay(_))
    }
}

/// Result of a save call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Staged changes were written
    Saved,
    /// Nothing was staged
    Unchanged,
    /// The target member left before the write landed; staged changes were discarded
    Dropped,
}
