//! Local mirror of a session record
//!
//! `LocalSession` caches the last accepted snapshot and the changes staged by
//! this process but not yet written. Staged values are visible in the mirror
//! immediately and are pinned against incoming snapshots until they are
//! saved, so the echo of our own write reconciles to "no change".

use std::collections::BTreeMap;

use tracing::warn;

use lobbysync_domain::{
    MemberRecord, PlayerId, Property, PropertyMap, SessionEvent, SessionId, SessionRecord,
};
use lobbysync_shared::{apply_property_update, PropertyUpdate, UpdateSessionRequest};

use crate::application::reconcile::{PropertyReconciler, RosterReconciler};

#[derive(Debug, Clone)]
pub struct LocalSession {
    record: SessionRecord,
    pending: UpdateSessionRequest,
    pending_members: BTreeMap<PlayerId, PropertyUpdate>,
}

impl LocalSession {
    pub fn new(record: SessionRecord) -> Self {
        Self {
            record,
            pending: UpdateSessionRequest::default(),
            pending_members: BTreeMap::new(),
        }
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn id(&self) -> &SessionId {
        &self.record.id
    }

    pub fn players(&self) -> &[MemberRecord] {
        &self.record.members
    }

    pub fn player(&self, id: &PlayerId) -> Option<&MemberRecord> {
        self.record.member(id)
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.record.properties
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Session-level changes are waiting to be saved.
    pub fn is_modified(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_player_modified(&self, id: &PlayerId) -> bool {
        self.pending_members
            .get(id)
            .is_some_and(|update| !update.is_empty())
    }

    pub fn pending(&self) -> &UpdateSessionRequest {
        &self.pending
    }

    pub fn pending_for(&self, id: &PlayerId) -> Option<&PropertyUpdate> {
        self.pending_members.get(id)
    }

    pub fn stage_name(&mut self, name: String) {
        self.record.name = name.clone();
        self.pending.name = Some(name);
    }

    pub fn stage_max_players(&mut self, max_players: u32) {
        self.record.max_players = max_players;
        self.pending.max_players = Some(max_players);
    }

    pub fn stage_private(&mut self, is_private: bool) {
        self.record.is_private = is_private;
        self.pending.is_private = Some(is_private);
    }

    pub fn stage_locked(&mut self, is_locked: bool) {
        self.record.is_locked = is_locked;
        self.pending.is_locked = Some(is_locked);
    }

    /// Host changes are not mirrored until the store confirms them, so the
    /// local role never runs ahead of the record.
    pub fn stage_host(&mut self, host_id: PlayerId) {
        self.pending.host_id = Some(host_id);
    }

    /// An empty password clears it.
    pub fn stage_password(&mut self, password: String) {
        self.record.has_password = !password.is_empty();
        self.pending.password = Some(password);
    }

    /// Stage a session property; `None` removes the key.
    pub fn stage_session_property(&mut self, key: String, property: Option<Property>) {
        let staged = self.pending.properties.contains_key(&key);
        if !staged && self.record.properties.get(&key) == property.as_ref() {
            return;
        }
        let mut update = PropertyUpdate::new();
        update.insert(key.clone(), property.clone());
        apply_property_update(&mut self.record.properties, &update);
        self.pending.properties.insert(key, property);
    }

    /// Stage a member property. Returns false if the member is not in the roster.
    pub fn stage_player_property(
        &mut self,
        id: &PlayerId,
        key: String,
        property: Option<Property>,
    ) -> bool {
        let staged = self
            .pending_members
            .get(id)
            .is_some_and(|update| update.contains_key(&key));
        let Some(member) = self.record.members.iter_mut().find(|m| &m.id == id) else {
            return false;
        };
        if !staged && member.properties.get(&key) == property.as_ref() {
            return true;
        }
        let mut update = PropertyUpdate::new();
        update.insert(key.clone(), property.clone());
        apply_property_update(&mut member.properties, &update);
        self.pending_members
            .entry(id.clone())
            .or_default()
            .insert(key, property);
        true
    }

    pub fn clear_pending(&mut self) {
        self.pending = UpdateSessionRequest::default();
    }

    pub fn clear_player_pending(&mut self, id: &PlayerId) -> bool {
        self.pending_members.remove(id).is_some()
    }

    pub fn clear_all_pending(&mut self) {
        self.pending = UpdateSessionRequest::default();
        self.pending_members.clear();
    }

    /// Drop a member from the mirror without raising roster events.
    pub fn forget_player(&mut self, id: &PlayerId) {
        self.record.members.retain(|m| &m.id != id);
        self.pending_members.remove(id);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Fold a newer snapshot into the mirror and return the raised events.
    ///
    /// Order: roster (leaving/left, joined), session properties, player
    /// properties, host change, then `Changed` if anything at all changed.
    /// Staged keys and fields are kept. Staged writes for members that left
    /// are discarded since they can no longer land.
    pub fn reconcile(&mut self, snapshot: &SessionRecord) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        let roster =
            RosterReconciler::reconcile(&mut self.record.members, &snapshot.members, &mut events);
        for gone in &roster.left {
            if self.pending_members.remove(gone).is_some() {
                warn!(
                    session_id = %self.record.id,
                    player_id = %gone,
                    "Dropping staged player data for a member that left"
                );
            }
        }

        PropertyReconciler::reconcile_session(
            &mut self.record.properties,
            &snapshot.properties,
            Some(&self.pending.properties),
            &mut events,
        );
        PropertyReconciler::reconcile_members(
            &mut self.record.members,
            &snapshot.members,
            &self.pending_members,
            &roster.joined,
            &mut events,
        );

        let fields_changed = self.apply_fields(snapshot);

        if self.record.host_id != snapshot.host_id {
            self.record.host_id = snapshot.host_id.clone();
            events.push(SessionEvent::SessionHostChanged(snapshot.host_id.clone()));
        }

        self.record.created = snapshot.created;
        self.record.last_updated = snapshot.last_updated;

        if !events.is_empty() || fields_changed {
            events.push(SessionEvent::Changed);
        }
        events
    }

    /// Replace the whole cache with `snapshot`, discarding staged changes.
    ///
    /// Events describe the difference from the previous cache, but the
    /// resulting mirror is exactly the snapshot.
    pub fn replace(&mut self, snapshot: SessionRecord) -> Vec<SessionEvent> {
        self.clear_all_pending();
        let events = self.reconcile(&snapshot);
        self.record = snapshot;
        events
    }

    fn apply_fields(&mut self, snapshot: &SessionRecord) -> bool {
        let mut changed = false;
        let pending = &self.pending;
        let record = &mut self.record;

        if pending.name.is_none() && record.name != snapshot.name {
            record.name = snapshot.name.clone();
            changed = true;
        }
        if pending.max_players.is_none() && record.max_players != snapshot.max_players {
            record.max_players = snapshot.max_players;
            changed = true;
        }
        if pending.is_private.is_none() && record.is_private != snapshot.is_private {
            record.is_private = snapshot.is_private;
            changed = true;
        }
        if pending.is_locked.is_none() && record.is_locked != snapshot.is_locked {
            record.is_locked = snapshot.is_locked;
            changed = true;
        }
        if pending.password.is_none() && record.has_password != snapshot.has_password {
            record.has_password = snapshot.has_password;
            changed = true;
        }
        if record.code != snapshot.code {
            record.code = snapshot.code.clone();
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use lobbysync_domain::Visibility;

    fn pid(s: &str) -> PlayerId {
        PlayerId::new(s).expect("valid player id")
    }

    fn snapshot(members: &[(&str, &str)], host: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: SessionId::new("s-1").expect("valid session id"),
            name: "Lobby".into(),
            code: Some("QX7".into()),
            host_id: pid(host),
            max_players: 4,
            is_private: false,
            is_locked: false,
            has_password: false,
            created: now,
            last_updated: now,
            properties: PropertyMap::new(),
            members: members
                .iter()
                .map(|(id, ready)| {
                    let mut props = PropertyMap::new();
                    props.insert("ready".into(), Property::public(*ready));
                    MemberRecord::new(pid(id), props, now)
                })
                .collect(),
        }
    }

    #[test]
    fn identical_snapshot_twice_raises_nothing_the_second_time() {
        let first = snapshot(&[("a", "0")], "a");
        let mut local = LocalSession::new(first.clone());

        let mut next = snapshot(&[("a", "1"), ("b", "0")], "a");
        next.properties.insert("mode".into(), Property::public("ffa"));
        next.last_updated = first.last_updated + Duration::seconds(1);

        let events = local.reconcile(&next);
        assert!(events.contains(&SessionEvent::PlayerJoined(pid("b"))));
        assert!(events.contains(&SessionEvent::SessionPropertiesChanged));
        assert_eq!(events.last(), Some(&SessionEvent::Changed));

        assert!(local.reconcile(&next).is_empty());
    }

    #[test]
    fn echo_of_own_write_is_suppressed() {
        let record = snapshot(&[("a", "0"), ("b", "0")], "a");
        let mut local = LocalSession::new(record.clone());

        assert!(local.stage_player_property(&pid("a"), "ready".into(), Some(Property::public("1"))));
        local.stage_session_property("started".into(), Some(Property::public("1")));
        assert!(local.is_modified());
        assert!(local.is_player_modified(&pid("a")));

        // Write lands, staged state is cleared, then the store echoes it back
        local.clear_pending();
        local.clear_player_pending(&pid("a"));

        let mut echo = record;
        echo.members[0]
            .properties
            .insert("ready".into(), Property::public("1"));
        echo.properties
            .insert("started".into(), Property::public("1"));

        assert!(local.reconcile(&echo).is_empty());
    }

    #[test]
    fn staged_values_survive_an_unrelated_snapshot() {
        let record = snapshot(&[("a", "0")], "a");
        let mut local = LocalSession::new(record.clone());
        local.stage_name("Renamed".into());
        local.stage_session_property("map".into(), Some(Property::public("dunes")));

        let mut remote = record;
        remote.is_private = true;
        let events = local.reconcile(&remote);

        assert_eq!(events, vec![SessionEvent::Changed]);
        assert_eq!(local.record().name, "Renamed");
        assert!(local.record().is_private);
        assert_eq!(
            local.properties().get("map").and_then(Property::value),
            Some("dunes")
        );
    }

    #[test]
    fn staged_write_for_departed_member_is_dropped() {
        let record = snapshot(&[("a", "0"), ("b", "0")], "a");
        let mut local = LocalSession::new(record);
        assert!(local.stage_player_property(
            &pid("b"),
            "ready".into(),
            Some(Property::new("1", Visibility::Member))
        ));

        let events = local.reconcile(&snapshot(&[("a", "0")], "a"));

        assert!(events.contains(&SessionEvent::PlayerHasLeft(pid("b"))));
        assert!(!local.is_player_modified(&pid("b")));
        assert!(local.pending_for(&pid("b")).is_none());
    }

    #[test]
    fn host_change_is_reported_after_property_events() {
        let mut local = LocalSession::new(snapshot(&[("a", "0"), ("b", "0")], "a"));
        let events = local.reconcile(&snapshot(&[("a", "0"), ("b", "1")], "b"));

        assert_eq!(
            events,
            vec![
                SessionEvent::PlayerPropertiesChanged {
                    players: vec![pid("b")]
                },
                SessionEvent::SessionHostChanged(pid("b")),
                SessionEvent::Changed,
            ]
        );
    }

    #[test]
    fn replace_discards_staged_changes() {
        let mut local = LocalSession::new(snapshot(&[("a", "0")], "a"));
        local.stage_session_property("map".into(), Some(Property::public("dunes")));

        let fresh = snapshot(&[("a", "1"), ("c", "0")], "a");
        let events = local.replace(fresh.clone());

        assert!(events.contains(&SessionEvent::PlayerJoined(pid("c"))));
        assert!(!local.is_modified());
        assert_eq!(local.record(), &fresh);
    }

    #[test]
    fn staging_an_unknown_member_is_refused() {
        let mut local = LocalSession::new(snapshot(&[("a", "0")], "a"));
        assert!(!local.stage_player_property(&pid("zz"), "ready".into(), None));
    }
}
