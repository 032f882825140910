//! The shared session record
//!
//! The record is owned by the remote session store. Every peer caches a copy
//! and derives its local view from it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::MemberRecord;
use crate::error::DomainError;
use crate::ids::{PlayerId, SessionId};
use crate::value_objects::{Property, PropertyMap};

/// Snapshot of a session record as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    /// Short human-typeable join code issued by the store
    #[serde(default)]
    pub code: Option<String>,
    pub host_id: PlayerId,
    pub max_players: u32,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub has_password: bool,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub members: Vec<MemberRecord>,
}

impl SessionRecord {
    pub fn member(&self, id: &PlayerId) -> Option<&MemberRecord> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn contains_member(&self, id: &PlayerId) -> bool {
        self.member(id).is_some()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &PlayerId> {
        self.members.iter().map(|m| &m.id)
    }

    pub fn player_count(&self) -> usize {
        self.members.len()
    }

    pub fn available_slots(&self) -> u32 {
        let count = u32::try_from(self.members.len()).unwrap_or(u32::MAX);
        self.max_players.saturating_sub(count)
    }

    pub fn property(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    /// The member currently holding the host id, if the host is a member.
    pub fn host(&self) -> Option<&MemberRecord> {
        self.member(&self.host_id)
    }

    /// Whether `self` was produced after `other` by the store's own clock.
    pub fn is_older_than(&self, other: &SessionRecord) -> bool {
        self.last_updated < other.last_updated
    }

    /// Check record invariants.
    ///
    /// Member ids are unique, the roster fits `max_players`, and the host id
    /// references a current member. A record hosted by a dedicated server has
    /// no host member; pass `allow_external_host` for those.
    pub fn validate(&self, allow_external_host: bool) -> Result<(), DomainError> {
        let mut seen = HashSet::with_capacity(self.members.len());
        for member in &self.members {
            if !seen.insert(&member.id) {
                return Err(DomainError::invariant(format!(
                    "duplicate member {} in session {}",
                    member.id, self.id
                )));
            }
        }

        if self.max_players == 0 {
            return Err(DomainError::invariant("max players must be at least 1"));
        }

        if self.members.len() > self.max_players as usize {
            return Err(DomainError::invariant(format!(
                "session {} has {} members but allows {}",
                self.id,
                self.members.len(),
                self.max_players
            )));
        }

        if !allow_external_host && !self.contains_member(&self.host_id) {
            return Err(DomainError::invariant(format!(
                "host {} is not a member of session {}",
                self.host_id, self.id
            )));
        }

        Ok(())
    }
}
