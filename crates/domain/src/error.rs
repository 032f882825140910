//! Unified error types for the domain layer
//!
//! Provides a common error type for record validation and state transitions,
//! so adapters never have to fall back to String or anyhow.

use thiserror::Error;

use crate::types::SessionState;

/// Unified error type for domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Validation failed (e.g., invalid field values)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Invalid ID format
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// A record broke one of its invariants
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// State transition not allowed
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: SessionState, to: SessionState },
}

impl DomainError {
    /// Creates a validation error for malformed input.
    ///
    /// # Example
    /// ```ignore
    /// if max_players == 0 {
    ///     return Err(DomainError::validation("max players must be at least 1"));
    /// }
    /// ```
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid ID error
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an invalid state transition error
    pub fn invalid_state_transition(from: SessionState, to: SessionState) -> Self {
        Self::InvalidStateTransition { from, to }
    }
}
