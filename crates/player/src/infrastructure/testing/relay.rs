//! In-memory relay shared by every participant of a local run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ports::outbound::{JoinEndpoint, RelayError, RelayPort};

#[derive(Default)]
pub struct InMemoryRelay {
    allocations: Mutex<HashSet<String>>,
    join_attempts: AtomicUsize,
    reject_joins: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `join_code` joinable as if a host had allocated it.
    pub async fn register(&self, join_code: impl Into<String>) {
        self.allocations.lock().await.insert(join_code.into());
    }

    pub fn join_attempts(&self) -> usize {
        self.join_attempts.load(Ordering::SeqCst)
    }

    /// Refuse every join, valid code or not.
    pub fn set_reject_joins(&self, reject: bool) {
        self.reject_joins.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayPort for InMemoryRelay {
    async fn allocate(&self, max_players: u32) -> Result<JoinEndpoint, RelayError> {
        if max_players == 0 {
            return Err(RelayError::AllocationFailed(
                "allocation needs at least one slot".into(),
            ));
        }
        let join_code: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect::<String>()
            .to_ascii_uppercase();
        self.allocations.lock().await.insert(join_code.clone());
        Ok(JoinEndpoint { join_code })
    }

    async fn join(&self, join_code: &str) -> Result<(), RelayError> {
        self.join_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_joins.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable);
        }
        if !self.allocations.lock().await.contains(join_code) {
            return Err(RelayError::InvalidJoinCode(join_code.to_string()));
        }
        Ok(())
    }
}
