//! Snapshot reconciliation
//!
//! Pure functions that fold an incoming store snapshot into the local mirror
//! and describe what changed as ordered `SessionEvent`s. Membership changes
//! are always computed before property changes for the same snapshot.

use std::collections::{BTreeMap, HashSet};

use lobbysync_domain::{MemberRecord, PlayerId, PropertyMap, SessionEvent};
use lobbysync_shared::PropertyUpdate;

/// Membership changes found while reconciling one snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RosterChanges {
    pub joined: Vec<PlayerId>,
    pub left: Vec<PlayerId>,
}

impl RosterChanges {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

pub struct RosterReconciler;

impl RosterReconciler {
    /// Bring `roster` to the membership of `incoming`.
    ///
    /// Each removed member raises `PlayerLeaving` (with its last known record)
    /// before it is dropped and `PlayerHasLeft` after. New members are
    /// appended and raise `PlayerJoined`. Members present in both keep their
    /// position; their timestamps are refreshed and their properties are left
    /// to [`PropertyReconciler`].
    pub fn reconcile(
        roster: &mut Vec<MemberRecord>,
        incoming: &[MemberRecord],
        events: &mut Vec<SessionEvent>,
    ) -> RosterChanges {
        let mut changes = RosterChanges::default();
        let incoming_ids: HashSet<&PlayerId> = incoming.iter().map(|m| &m.id).collect();

        let removed: Vec<MemberRecord> = roster
            .iter()
            .filter(|m| !incoming_ids.contains(&m.id))
            .cloned()
            .collect();
        for member in removed {
            let player_id = member.id.clone();
            events.push(SessionEvent::PlayerLeaving {
                player_id: player_id.clone(),
                last_known: member,
            });
            roster.retain(|m| m.id != player_id);
            events.push(SessionEvent::PlayerHasLeft(player_id.clone()));
            changes.left.push(player_id);
        }

        for member in incoming {
            match roster.iter_mut().find(|m| m.id == member.id) {
                Some(existing) => {
                    existing.joined = member.joined;
                    existing.last_updated = member.last_updated;
                }
                None => {
                    roster.push(member.clone());
                    events.push(SessionEvent::PlayerJoined(member.id.clone()));
                    changes.joined.push(member.id.clone());
                }
            }
        }

        changes
    }
}

pub struct PropertyReconciler;

impl PropertyReconciler {
    /// Fold `incoming` into `local`, skipping keys staged locally in `pinned`.
    ///
    /// Values are compared by value only; a visibility-only change is adopted
    /// silently. Returns whether any key was added, removed or changed value.
    pub fn reconcile(
        local: &mut PropertyMap,
        incoming: &PropertyMap,
        pinned: Option<&PropertyUpdate>,
    ) -> bool {
        let is_pinned = |key: &str| pinned.is_some_and(|p| p.contains_key(key));
        let mut changed = false;

        let removed: Vec<String> = local
            .keys()
            .filter(|key| !incoming.contains_key(key.as_str()) && !is_pinned(key.as_str()))
            .cloned()
            .collect();
        for key in removed {
            local.remove(&key);
            changed = true;
        }

        for (key, property) in incoming {
            if is_pinned(key.as_str()) {
                continue;
            }
            match local.get_mut(key) {
                Some(existing) if existing.same_value(property) => {
                    existing.visibility = property.visibility;
                }
                Some(existing) => {
                    *existing = property.clone();
                    changed = true;
                }
                None => {
                    local.insert(key.clone(), property.clone());
                    changed = true;
                }
            }
        }

        changed
    }

    /// Session-level pass; raises `SessionPropertiesChanged` at most once.
    pub fn reconcile_session(
        local: &mut PropertyMap,
        incoming: &PropertyMap,
        pinned: Option<&PropertyUpdate>,
        events: &mut Vec<SessionEvent>,
    ) -> bool {
        let changed = Self::reconcile(local, incoming, pinned);
        if changed {
            events.push(SessionEvent::SessionPropertiesChanged);
        }
        changed
    }

    /// Member-level pass over members present in both rosters.
    ///
    /// Members in `skip` (just joined) already carry their incoming
    /// properties. Raises one `PlayerPropertiesChanged` listing every member
    /// whose properties changed, in roster order.
    pub fn reconcile_members(
        roster: &mut [MemberRecord],
        incoming: &[MemberRecord],
        pinned: &BTreeMap<PlayerId, PropertyUpdate>,
        skip: &[PlayerId],
        events: &mut Vec<SessionEvent>,
    ) -> Vec<PlayerId> {
        let mut players = Vec::new();
        for member in roster.iter_mut() {
            if skip.contains(&member.id) {
                continue;
            }
            let Some(remote) = incoming.iter().find(|m| m.id == member.id) else {
                continue;
            };
            if Self::reconcile(
                &mut member.properties,
                &remote.properties,
                pinned.get(&member.id),
            ) {
                players.push(member.id.clone());
            }
        }
        if !players.is_empty() {
            events.push(SessionEvent::PlayerPropertiesChanged {
                players: players.clone(),
            });
        }
        players
    }
}
