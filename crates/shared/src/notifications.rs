//! Change notifications delivered by a session subscription
//!
//! ## Versioning Policy
//!
//! - New variants can be added at the end (forward compatible)
//! - Unknown notification kinds deserialize to `Unknown` and are ignored

use std::fmt;

use serde::{Deserialize, Serialize};

use lobbysync_domain::{PlayerId, SessionRecord};

/// State of the notification channel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Subscribing,
    Subscribed,
    /// Subscribed, but notifications may have been missed
    Unsynced,
    Unsubscribed,
    Error,
}

impl SubscriptionState {
    /// The channel stopped delivering notifications.
    pub fn is_lost(&self) -> bool {
        matches!(self, SubscriptionState::Unsubscribed | SubscriptionState::Error)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Subscribing => write!(f, "subscribing"),
            SubscriptionState::Subscribed => write!(f, "subscribed"),
            SubscriptionState::Unsynced => write!(f, "unsynced"),
            SubscriptionState::Unsubscribed => write!(f, "unsubscribed"),
            SubscriptionState::Error => write!(f, "error"),
        }
    }
}

/// One notification from the store's subscription feed.
///
/// Delivery is at-least-once; `RecordChanged` carries a full snapshot and is
/// always authoritative. The member hints may arrive before or after the
/// snapshot that reflects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreNotification {
    RecordChanged { snapshot: SessionRecord },
    MemberJoined { player_id: PlayerId },
    MemberLeaving { player_id: PlayerId },
    MemberLeft { player_id: PlayerId },
    /// The subscriber was removed from the session by someone else
    Kicked,
    RecordDeleted,
    ConnectionStateChanged { state: SubscriptionState },
    #[serde(other)]
    Unknown,
}
