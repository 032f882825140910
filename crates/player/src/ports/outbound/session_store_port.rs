//! Session Store Port - the remote service that owns session records
//!
//! The store is an opaque service: it replicates the record, enforces write
//! authorization and visibility, expires records whose heartbeat lapses, and
//! delivers change notifications at least once. Nothing here reimplements
//! that behavior; adapters translate calls into the service's transport.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use lobbysync_domain::{PlayerId, SessionId, SessionRecord};
use lobbysync_shared::{
    CreateSessionRequest, JoinSessionRequest, StoreNotification, SubscriptionState,
    UpdateMemberRequest, UpdateSessionRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Member {player_id} not found in session {session_id}")]
    MemberNotFound {
        session_id: SessionId,
        player_id: PlayerId,
    },
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Store request failed: {0}")]
    Request(String),
    #[error("Store unavailable")]
    Unavailable,
}

impl StoreError {
    /// The session record itself is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_member_not_found(&self) -> bool {
        matches!(self, StoreError::MemberNotFound { .. })
    }
}

/// Live notification feed for one session.
///
/// Dropping the subscription (or calling [`StoreSubscription::unsubscribe`])
/// closes the receiving side; the store stops delivering to it.
#[derive(Debug)]
pub struct StoreSubscription {
    receiver: mpsc::UnboundedReceiver<StoreNotification>,
    closed: bool,
}

impl StoreSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<StoreNotification>) -> Self {
        Self {
            receiver,
            closed: false,
        }
    }

    /// Take every notification that is ready without waiting.
    ///
    /// When the store side hung up, a single
    /// `ConnectionStateChanged { state: Unsubscribed }` is appended so callers
    /// handle a dropped feed like any other lost subscription.
    pub fn drain(&mut self) -> Vec<StoreNotification> {
        let mut notifications = Vec::new();
        if self.closed {
            return notifications;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => notifications.push(notification),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    notifications.push(StoreNotification::ConnectionStateChanged {
                        state: SubscriptionState::Unsubscribed,
                    });
                    break;
                }
            }
        }
        notifications
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Port for the remote session record store.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionStorePort: Send + Sync {
    /// Create a record. The owner becomes host and, unless the request is
    /// server hosted, its first member.
    async fn create(
        &self,
        owner: &PlayerId,
        request: CreateSessionRequest,
    ) -> Result<SessionRecord, StoreError>;

    async fn get(&self, session_id: &SessionId) -> Result<SessionRecord, StoreError>;

    async fn join(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
        request: JoinSessionRequest,
    ) -> Result<SessionRecord, StoreError>;

    /// Update session fields and properties; only present fields are written.
    async fn update(
        &self,
        session_id: &SessionId,
        request: UpdateSessionRequest,
    ) -> Result<SessionRecord, StoreError>;

    async fn update_member(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
        request: UpdateMemberRequest,
    ) -> Result<SessionRecord, StoreError>;

    async fn remove_member(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
    ) -> Result<(), StoreError>;

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError>;

    /// Keep-alive for the record; only the host is expected to send it.
    async fn heartbeat(&self, session_id: &SessionId) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        session_id: &SessionId,
        subscriber: &PlayerId,
    ) -> Result<StoreSubscription, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_reports_closed_feed_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = StoreSubscription::new(rx);

        tx.send(StoreNotification::Kicked).expect("send");
        drop(tx);

        let first = subscription.drain();
        assert_eq!(
            first,
            vec![
                StoreNotification::Kicked,
                StoreNotification::ConnectionStateChanged {
                    state: SubscriptionState::Unsubscribed
                }
            ]
        );
        assert!(subscription.drain().is_empty());
    }

    #[test]
    fn test_drain_empty_feed() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut subscription = StoreSubscription::new(rx);
        assert!(subscription.drain().is_empty());
    }
}
