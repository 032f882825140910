//! Session state machine
//!
//! A `Session` is the local view of one remote session record. It owns the
//! connection state (`None -> Connected -> {Disconnected, Deleted}`), the
//! local mirror, the notification feed and the host heartbeat, and raises
//! `SessionEvent`s on the shared event bus.
//!
//! Every mutating operation takes `&mut self`, so calls against one session
//! are serialized and at most one write per resource is outstanding. Remote
//! data only changes the mirror through snapshots: notifications, refreshes,
//! and the records returned by our own writes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use lobbysync_domain::{
    DomainError, MemberRecord, PlayerId, Property, PropertyMap, SessionEvent, SessionId,
    SessionRecord, SessionRole, SessionState,
};
use lobbysync_shared::{
    keys, CreateSessionRequest, JoinSessionRequest, StoreNotification, SubscriptionState,
    UpdateMemberRequest,
};

use crate::application::error::{SessionError, WriteOutcome};
use crate::application::heartbeat::HeartbeatScheduler;
use crate::application::host::{HostSession, ServerSession};
use crate::application::local_session::LocalSession;
use crate::infrastructure::backoff::{BackoffPolicy, BackoffState};
use crate::infrastructure::config::SessionConfig;
use crate::infrastructure::messaging::{set_session_state, EventBus, SharedSessionState};
use crate::ports::outbound::{SessionStorePort, StoreError, StoreSubscription};

/// Who the local process is in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIdentity {
    /// A human participant that is a member of the record
    Player(PlayerId),
    /// A dedicated server that hosts the record without being a member
    Server(PlayerId),
}

impl LocalIdentity {
    pub fn id(&self) -> &PlayerId {
        match self {
            LocalIdentity::Player(id) | LocalIdentity::Server(id) => id,
        }
    }

    pub fn player_id(&self) -> Option<&PlayerId> {
        match self {
            LocalIdentity::Player(id) => Some(id),
            LocalIdentity::Server(_) => None,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, LocalIdentity::Server(_))
    }
}

/// Collaborators shared by every session of one process.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn SessionStorePort>,
    pub events: EventBus,
    pub state: SharedSessionState,
    pub config: SessionConfig,
}

/// Background reconnect after a lost feed.
#[derive(Debug)]
struct ReconnectSchedule {
    enabled: bool,
    armed: bool,
    backoff: BackoffState,
    wait: Duration,
}

impl ReconnectSchedule {
    fn new(enabled: bool, policy: BackoffPolicy) -> Self {
        Self {
            enabled,
            armed: false,
            backoff: BackoffState::new(policy),
            wait: Duration::ZERO,
        }
    }

    fn arm(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.backoff.reset();
        self.armed = true;
        self.schedule_next()
    }

    fn schedule_next(&mut self) -> bool {
        match self.backoff.next_delay_and_advance() {
            Some(delay) => {
                self.wait = delay;
                true
            }
            None => {
                self.armed = false;
                false
            }
        }
    }

    /// Count down; true when the next attempt is due.
    fn advance(&mut self, dt: Duration) -> bool {
        self.wait = self.wait.saturating_sub(dt);
        self.wait.is_zero()
    }

    fn disarm(&mut self) {
        self.armed = false;
        self.backoff.reset();
    }
}

pub struct Session {
    store: Arc<dyn SessionStorePort>,
    events: EventBus,
    shared_state: SharedSessionState,
    identity: LocalIdentity,
    state: SessionState,
    local: LocalSession,
    subscription: Option<StoreSubscription>,
    heartbeat: HeartbeatScheduler,
    reconnect_schedule: ReconnectSchedule,
    needs_refresh: bool,
}

impl Session {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a record and attach to it. A server identity creates a
    /// server-hosted record it is not a member of.
    pub async fn create(
        ctx: SessionContext,
        identity: LocalIdentity,
        request: CreateSessionRequest,
    ) -> Result<Self, SessionError> {
        request.validate()?;
        let request = if identity.is_server() {
            request.hosted_by_server()
        } else {
            request
        };
        let record = ctx.store.create(identity.id(), request).await?;
        info!(
            session_id = %record.id,
            host_id = %record.host_id,
            max_players = record.max_players,
            "Session created"
        );
        Self::attach(ctx, identity, record).await
    }

    /// Join an existing record as a member.
    pub async fn join(
        ctx: SessionContext,
        identity: LocalIdentity,
        session_id: &SessionId,
        request: JoinSessionRequest,
    ) -> Result<Self, SessionError> {
        let Some(player_id) = identity.player_id() else {
            return Err(SessionError::invalid_operation(
                "a dedicated server cannot join a session as a member",
            ));
        };
        let record = ctx.store.join(session_id, player_id, request).await?;
        info!(session_id = %record.id, player_id = %player_id, "Joined session");
        Self::attach(ctx, identity, record).await
    }

    async fn attach(
        ctx: SessionContext,
        identity: LocalIdentity,
        record: SessionRecord,
    ) -> Result<Self, SessionError> {
        if let Err(e) = record.validate(true) {
            warn!(session_id = %record.id, error = %e, "Session record failed validation");
        }

        let mut session = Self {
            heartbeat: HeartbeatScheduler::new(
                ctx.config.heartbeat_period,
                ctx.config.handshake_heartbeat_period,
            ),
            reconnect_schedule: ReconnectSchedule::new(
                ctx.config.auto_reconnect,
                ctx.config.reconnect,
            ),
            store: ctx.store,
            events: ctx.events,
            shared_state: ctx.state,
            identity,
            state: SessionState::None,
            local: LocalSession::new(record),
            subscription: None,
            needs_refresh: false,
        };
        set_session_state(&session.shared_state, SessionState::None);

        // Reconcile once from a read taken after the feed is live, so no
        // change between the join and the subscription is missed.
        let fresh = match session.subscribe_fresh().await {
            Ok(fresh) => fresh,
            Err(e) => {
                session.release().await;
                return Err(e.into());
            }
        };
        if let Some(me) = session.identity.player_id().cloned() {
            if !fresh.contains_member(&me) {
                session.teardown();
                return Err(SessionError::invalid_operation(format!(
                    "{} was removed from session {} while joining",
                    me,
                    fresh.id
                )));
            }
        }

        let mut events = session.transition(SessionState::Connected)?;
        events.extend(session.local.reconcile(&fresh));
        session.publish(events).await;
        Ok(session)
    }

    /// Best-effort undo of a create or join whose attach failed.
    async fn release(&mut self) {
        let result = match &self.identity {
            LocalIdentity::Server(_) => self.store.delete(self.local.id()).await,
            LocalIdentity::Player(me) => self.store.remove_member(self.local.id(), me).await,
        };
        if let Err(e) = result {
            warn!(session_id = %self.local.id(), error = %e, "Failed to release half-joined session");
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn id(&self) -> &SessionId {
        self.local.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn record(&self) -> &SessionRecord {
        self.local.record()
    }

    pub fn players(&self) -> &[MemberRecord] {
        self.local.players()
    }

    pub fn player(&self, id: &PlayerId) -> Option<&MemberRecord> {
        self.local.player(id)
    }

    /// The local member record; `None` for a server or after leaving.
    pub fn local_player(&self) -> Option<&MemberRecord> {
        self.identity
            .player_id()
            .and_then(|me| self.local.player(me))
    }

    pub fn properties(&self) -> &PropertyMap {
        self.local.properties()
    }

    pub fn property_value(&self, key: &str) -> Option<&str> {
        self.local.properties().get(key).and_then(Property::value)
    }

    pub fn role(&self) -> SessionRole {
        match &self.identity {
            LocalIdentity::Server(_) => SessionRole::Server,
            LocalIdentity::Player(me) if &self.local.record().host_id == me => SessionRole::Host,
            LocalIdentity::Player(_) => SessionRole::Client,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role().has_host_privileges()
    }

    pub fn is_member(&self) -> bool {
        !self.state.is_terminal() && self.local_player().is_some()
    }

    /// Session-level changes are staged and not yet saved.
    pub fn is_modified(&self) -> bool {
        self.local.is_modified()
    }

    pub fn is_player_modified(&self, id: &PlayerId) -> bool {
        self.local.is_player_modified(id)
    }

    pub fn is_ready(&self, id: &PlayerId) -> bool {
        self.local
            .player(id)
            .and_then(|m| m.value(keys::READY))
            .is_some_and(|v| v == keys::FLAG_TRUE)
    }

    /// Every member has `ready = "1"`; false for an empty roster.
    pub fn is_everyone_ready(&self) -> bool {
        let players = self.local.players();
        !players.is_empty()
            && players
                .iter()
                .all(|m| m.value(keys::READY) == Some(keys::FLAG_TRUE))
    }

    /// The `started` marker is present in the session properties.
    pub fn is_started(&self) -> bool {
        self.property_value(keys::STARTED) == Some(keys::FLAG_TRUE)
    }

    /// The published join code, if any.
    pub fn join_code(&self) -> Option<&str> {
        self.local
            .properties()
            .get(keys::JOIN_CODE)
            .and_then(Property::non_empty_value)
    }

    /// Host may start: connected, everyone ready, not started yet.
    pub fn can_start(&self) -> bool {
        self.state.is_connected() && self.is_host() && self.is_everyone_ready() && !self.is_started()
    }

    pub fn is_heartbeat_busy(&self) -> bool {
        self.heartbeat.is_busy()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Pull the latest record and reconcile it.
    pub async fn refresh(&mut self) -> Result<(), SessionError> {
        self.ensure_not_deleted()?;
        match self.store.get(self.local.id()).await {
            Ok(record) => {
                self.apply_snapshot(record).await;
                Ok(())
            }
            Err(e) => Err(self.handle_store_error(e).await),
        }
    }

    /// Re-attach after a disconnect, replacing the whole cache.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Deleted => return Err(SessionError::SessionDeleted(self.id().clone())),
            other => {
                return Err(SessionError::invalid_operation(format!(
                    "cannot reconnect session {} from state {}",
                    self.id(),
                    other
                )))
            }
        }

        if let Some(me) = self.identity.player_id() {
            if self.local.player(me).is_none() {
                return Err(SessionError::invalid_operation(format!(
                    "{} is not a member of session {}",
                    me,
                    self.id()
                )));
            }
        }

        let fresh = match self.subscribe_fresh().await {
            Ok(fresh) => fresh,
            Err(e) => return Err(self.handle_store_error(e).await),
        };

        if let Some(me) = self.identity.player_id() {
            if !fresh.contains_member(me) {
                let me = me.clone();
                self.handle_removed().await;
                return Err(SessionError::invalid_operation(format!(
                    "{} is no longer a member of session {}",
                    me,
                    fresh.id
                )));
            }
        }

        if self.local.is_modified() {
            warn!(session_id = %self.id(), "Discarding staged session changes on reconnect");
        }
        let mut events = self.local.replace(fresh);
        events.extend(self.transition(SessionState::Connected)?);
        self.reconnect_schedule.disarm();
        self.needs_refresh = false;
        info!(session_id = %self.id(), "Session reconnected");
        self.publish(events).await;
        Ok(())
    }

    /// Leave the session. A dedicated server deletes it instead.
    ///
    /// Fails with `SessionDeleted` once the record is gone.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        self.ensure_not_deleted()?;
        if self.identity.is_server() {
            return self.delete().await;
        }
        let Some(me) = self.identity.player_id().cloned() else {
            return Ok(());
        };
        if !self.is_member() {
            return Err(SessionError::invalid_operation(format!(
                "{} is not a member of session {}",
                me,
                self.id()
            )));
        }

        self.teardown();
        match self.store.remove_member(self.local.id(), &me).await {
            Ok(()) => {}
            Err(e) if e.is_member_not_found() => {
                debug!(session_id = %self.id(), player_id = %me, "Already removed from session");
            }
            Err(e) if e.is_not_found() => {
                self.mark_deleted().await;
                return Ok(());
            }
            Err(e) => {
                self.restore_feed().await;
                return Err(e.into());
            }
        }

        self.local.forget_player(&me);
        self.local.clear_all_pending();
        let mut events = self.transition(SessionState::Disconnected)?;
        events.push(SessionEvent::RemovedFromSession);
        info!(session_id = %self.id(), player_id = %me, "Left session");
        self.publish(events).await;
        Ok(())
    }

    /// Delete the record. No-op once deleted. Host privileges required.
    pub(crate) async fn delete(&mut self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if !self.is_host() {
            return Err(SessionError::forbidden(format!(
                "{} is not the host of session {}",
                self.identity.id(),
                self.id()
            )));
        }

        self.teardown();
        match self.store.delete(self.local.id()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(session_id = %self.id(), "Session already gone");
            }
            Err(e) => {
                self.restore_feed().await;
                return Err(e.into());
            }
        }
        self.mark_deleted().await;
        Ok(())
    }

    /// Best-effort leave on process shutdown; failures are only logged.
    pub async fn shutdown(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        if let Err(e) = self.leave().await {
            warn!(session_id = %self.id(), error = %e, "Leave on shutdown failed");
        }
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    pub fn as_host(&mut self) -> Result<HostSession<'_>, SessionError> {
        self.ensure_not_deleted()?;
        if !self.is_host() {
            return Err(SessionError::forbidden(format!(
                "{} is not the host of session {}",
                self.identity.id(),
                self.id()
            )));
        }
        Ok(HostSession::new(self))
    }

    pub fn as_server(&mut self) -> Result<ServerSession<'_>, SessionError> {
        self.ensure_not_deleted()?;
        if !self.identity.is_server() {
            return Err(SessionError::forbidden(format!(
                "{} is not the dedicated server of session {}",
                self.identity.id(),
                self.id()
            )));
        }
        Ok(ServerSession::new(self))
    }

    // =========================================================================
    // Member data
    // =========================================================================

    /// Stage a property of the local member; `None` removes the key.
    pub fn set_player_property(
        &mut self,
        key: impl Into<String>,
        property: Option<Property>,
    ) -> Result<(), SessionError> {
        self.ensure_not_deleted()?;
        let Some(me) = self.identity.player_id().cloned() else {
            return Err(SessionError::invalid_operation(
                "a dedicated server has no member data",
            ));
        };
        self.stage_player_property(&me, key.into(), property)
    }

    pub async fn save_current_player_data(&mut self) -> Result<WriteOutcome, SessionError> {
        let me = self.identity.id().clone();
        self.save_player_data(&me).await
    }

    /// Stage and save the local ready flag.
    pub async fn set_ready(&mut self, ready: bool) -> Result<WriteOutcome, SessionError> {
        self.set_player_property(keys::READY, Some(Property::public(keys::flag(ready))))?;
        self.save_current_player_data().await
    }

    pub(crate) fn stage_player_property(
        &mut self,
        player_id: &PlayerId,
        key: String,
        property: Option<Property>,
    ) -> Result<(), SessionError> {
        if !self.local.stage_player_property(player_id, key, property) {
            return Err(SessionError::invalid_operation(format!(
                "{} is not a member of session {}",
                player_id,
                self.id()
            )));
        }
        Ok(())
    }

    /// Write staged data of one member.
    ///
    /// If the member is gone, locally or according to the store, the staged
    /// data is discarded and `WriteOutcome::Dropped` is returned.
    pub(crate) async fn save_player_data(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<WriteOutcome, SessionError> {
        self.ensure_not_deleted()?;
        let Some(update) = self
            .local
            .pending_for(player_id)
            .filter(|update| !update.is_empty())
            .cloned()
        else {
            return Ok(WriteOutcome::Unchanged);
        };

        if self.local.player(player_id).is_none() {
            self.local.clear_player_pending(player_id);
            warn!(session_id = %self.id(), player_id = %player_id, "Dropping write for departed member");
            return Ok(WriteOutcome::Dropped);
        }

        match self
            .store
            .update_member(self.local.id(), player_id, UpdateMemberRequest::new(update))
            .await
        {
            Ok(record) => {
                self.local.clear_player_pending(player_id);
                self.apply_snapshot(record).await;
                Ok(WriteOutcome::Saved)
            }
            Err(e) if e.is_member_not_found() => {
                self.local.clear_player_pending(player_id);
                warn!(session_id = %self.id(), player_id = %player_id, "Member left before the write landed");
                Ok(WriteOutcome::Dropped)
            }
            Err(e) => Err(self.handle_store_error(e).await),
        }
    }

    // =========================================================================
    // Host-side helpers used by the capability handles
    // =========================================================================

    pub(crate) fn local_mut(&mut self) -> &mut LocalSession {
        &mut self.local
    }

    pub(crate) async fn save_session_properties(&mut self) -> Result<WriteOutcome, SessionError> {
        self.ensure_not_deleted()?;
        if !self.local.is_modified() {
            return Ok(WriteOutcome::Unchanged);
        }
        let request = self.local.pending().clone();
        match self.store.update(self.local.id(), request).await {
            Ok(record) => {
                self.local.clear_pending();
                self.apply_snapshot(record).await;
                Ok(WriteOutcome::Saved)
            }
            Err(e) => Err(self.handle_store_error(e).await),
        }
    }

    /// Remove another member. The roster changes once the store confirms it.
    pub(crate) async fn remove_player(&mut self, player_id: &PlayerId) -> Result<(), SessionError> {
        self.ensure_not_deleted()?;
        if self.identity.player_id() == Some(player_id) {
            return Err(SessionError::invalid_operation(
                "use leave() to remove the local player",
            ));
        }
        match self.store.remove_member(self.local.id(), player_id).await {
            Ok(()) => {
                info!(session_id = %self.id(), player_id = %player_id, "Removed player");
                Ok(())
            }
            Err(e) if e.is_member_not_found() => Ok(()),
            Err(e) => Err(self.handle_store_error(e).await),
        }
    }

    /// Shorten the heartbeat period while the start handshake runs.
    pub(crate) fn accelerate_heartbeat(&mut self) {
        self.heartbeat.accelerate();
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Advance the session by `dt`: drain notifications, run a scheduled
    /// refresh, send a due heartbeat, and attempt a due reconnect.
    pub async fn tick(&mut self, dt: Duration) {
        if self.state.is_terminal() {
            return;
        }

        self.process_notifications().await;
        if self.state.is_terminal() {
            return;
        }

        if self.needs_refresh && self.state.is_connected() {
            self.needs_refresh = false;
            if let Err(e) = self.refresh().await {
                warn!(session_id = %self.id(), error = %e, "Background refresh failed");
            }
        }

        if self.heartbeat_active() {
            self.heartbeat.tick(dt, &self.store, self.local.id());
        }

        self.tick_reconnect(dt).await;
    }

    fn heartbeat_active(&self) -> bool {
        self.is_host() && (self.state.is_connected() || self.reconnect_schedule.armed)
    }

    async fn process_notifications(&mut self) {
        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };
        let notifications = subscription.drain();
        let mut hints: Vec<(PlayerId, bool)> = Vec::new();

        for notification in notifications {
            // A teardown earlier in the batch ends processing
            if !self.state.is_connected() {
                break;
            }
            match notification {
                StoreNotification::RecordChanged { snapshot } => self.apply_snapshot(snapshot).await,
                StoreNotification::MemberJoined { player_id } => hints.push((player_id, true)),
                StoreNotification::MemberLeaving { player_id }
                | StoreNotification::MemberLeft { player_id } => hints.push((player_id, false)),
                StoreNotification::Kicked => self.handle_removed().await,
                StoreNotification::RecordDeleted => self.mark_deleted().await,
                StoreNotification::ConnectionStateChanged { state } => match state {
                    s if s.is_lost() => self.mark_lost().await,
                    SubscriptionState::Unsynced => self.needs_refresh = true,
                    other => debug!(session_id = %self.id(), state = %other, "Subscription state"),
                },
                StoreNotification::Unknown => {
                    debug!(session_id = %self.id(), "Ignoring unknown store notification")
                }
            }
        }

        // Hints never change the roster; a mismatch only schedules a refresh
        if self.state.is_connected()
            && hints
                .iter()
                .any(|(id, present)| self.local.player(id).is_some() != *present)
        {
            debug!(session_id = %self.id(), "Roster hint disagrees with cache, refreshing");
            self.needs_refresh = true;
        }
    }

    async fn tick_reconnect(&mut self, dt: Duration) {
        if !self.reconnect_schedule.armed || self.state != SessionState::Disconnected {
            return;
        }
        if !self.reconnect_schedule.advance(dt) {
            return;
        }
        let attempt = self.reconnect_schedule.backoff.attempts();
        match self.reconnect().await {
            Ok(()) => {}
            Err(SessionError::SessionDeleted(_)) | Err(SessionError::InvalidOperation(_)) => {
                self.reconnect_schedule.disarm();
            }
            Err(e) => {
                warn!(session_id = %self.id(), attempt, error = %e, "Reconnect attempt failed");
                if !self.reconnect_schedule.schedule_next() {
                    warn!(session_id = %self.id(), "Giving up on reconnecting");
                }
            }
        }
    }

    // =========================================================================
    // Internal transitions
    // =========================================================================

    async fn apply_snapshot(&mut self, snapshot: SessionRecord) {
        if self.state.is_terminal() {
            return;
        }
        if &snapshot.id != self.local.id() {
            warn!(session_id = %self.id(), other = %snapshot.id, "Ignoring snapshot of another session");
            return;
        }
        if snapshot.is_older_than(self.local.record()) {
            debug!(session_id = %self.id(), "Ignoring stale snapshot");
            return;
        }
        if let Err(e) = snapshot.validate(true) {
            warn!(session_id = %self.id(), error = %e, "Ignoring invalid snapshot");
            return;
        }
        if let Some(me) = self.identity.player_id() {
            if !snapshot.contains_member(me) {
                if self.is_member() {
                    self.handle_removed().await;
                }
                return;
            }
        }

        let events = self.local.reconcile(&snapshot);
        if !events.is_empty() {
            debug!(session_id = %self.id(), count = events.len(), "Snapshot reconciled");
        }
        self.publish(events).await;
    }

    /// The local player was removed by someone else.
    async fn handle_removed(&mut self) {
        info!(session_id = %self.id(), "Removed from session");
        self.teardown();
        if let Some(me) = self.identity.player_id().cloned() {
            self.local.forget_player(&me);
        }
        self.local.clear_all_pending();
        let mut events = self.transition_or_log(SessionState::Disconnected);
        events.push(SessionEvent::RemovedFromSession);
        self.publish(events).await;
    }

    async fn mark_deleted(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!(session_id = %self.id(), "Session deleted");
        self.teardown();
        self.local.clear_all_pending();
        let mut events = self.transition_or_log(SessionState::Deleted);
        events.push(SessionEvent::Deleted);
        self.publish(events).await;
    }

    async fn mark_lost(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        warn!(session_id = %self.id(), "Session feed lost");
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        let events = self.transition_or_log(SessionState::Disconnected);
        if self.reconnect_schedule.arm() {
            debug!(session_id = %self.id(), "Reconnect scheduled");
        }
        self.publish(events).await;
    }

    /// Stop the feed and background work before a terminal call.
    fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.heartbeat.reset();
        self.reconnect_schedule.disarm();
        self.needs_refresh = false;
    }

    /// Resubscribe after a failed terminal call and catch up on anything
    /// delivered while the feed was down.
    async fn restore_feed(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        match self.subscribe_fresh().await {
            Ok(fresh) => self.apply_snapshot(fresh).await,
            Err(e) if e.is_not_found() => self.mark_deleted().await,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "Could not restore session feed");
                self.mark_lost().await;
            }
        }
    }

    async fn subscribe_fresh(&mut self) -> Result<SessionRecord, StoreError> {
        let subscription = self
            .store
            .subscribe(self.local.id(), self.identity.id())
            .await?;
        match self.store.get(self.local.id()).await {
            Ok(record) => {
                self.subscription = Some(subscription);
                Ok(record)
            }
            Err(e) => {
                subscription.unsubscribe();
                Err(e)
            }
        }
    }

    /// Map a store failure; a missing record moves the session to `Deleted`.
    async fn handle_store_error(&mut self, error: StoreError) -> SessionError {
        if error.is_not_found() {
            self.mark_deleted().await;
            return SessionError::SessionDeleted(self.id().clone());
        }
        error.into()
    }

    fn ensure_not_deleted(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::SessionDeleted(self.id().clone()));
        }
        Ok(())
    }

    /// Move to `next`, returning `StateChanged` then `Changed`.
    fn transition(&mut self, next: SessionState) -> Result<Vec<SessionEvent>, DomainError> {
        if self.state == next {
            return Ok(Vec::new());
        }
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_state_transition(self.state, next));
        }
        info!(session_id = %self.id(), from = %self.state, to = %next, "Session state changed");
        self.state = next;
        set_session_state(&self.shared_state, next);
        Ok(vec![SessionEvent::StateChanged(next), SessionEvent::Changed])
    }

    fn transition_or_log(&mut self, next: SessionState) -> Vec<SessionEvent> {
        match self.transition(next) {
            Ok(events) => events,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "Ignoring state transition");
                Vec::new()
            }
        }
    }

    async fn publish(&self, events: Vec<SessionEvent>) {
        self.events.dispatch_all(events).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::messaging::new_shared_state;
    use crate::infrastructure::testing::InMemorySessionStore;
    use crate::ports::outbound::MockSessionStorePort;
    use tokio::sync::mpsc;

    fn pid(s: &str) -> PlayerId {
        PlayerId::new(s).expect("valid player id")
    }

    fn context(store: Arc<dyn SessionStorePort>) -> SessionContext {
        SessionContext {
            store,
            events: EventBus::new(),
            state: new_shared_state(),
            config: SessionConfig {
                reconnect: BackoffPolicy {
                    initial_delay_ms: 100,
                    max_delay_ms: 400,
                    max_attempts: 3,
                },
                ..SessionConfig::default()
            },
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn host_session(
        store: &Arc<InMemorySessionStore>,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let ctx = context(store.clone());
        let (_, rx) = ctx.events.subscribe_channel().await;
        let session = Session::create(
            ctx,
            LocalIdentity::Player(pid("host")),
            CreateSessionRequest::new("Lobby", 4),
        )
        .await
        .expect("create session");
        (session, rx)
    }

    async fn client_session(store: &Arc<InMemorySessionStore>, id: &SessionId, name: &str) -> Session {
        Session::join(
            context(store.clone()),
            LocalIdentity::Player(pid(name)),
            id,
            JoinSessionRequest::default(),
        )
        .await
        .expect("join session")
    }

    #[tokio::test]
    async fn when_created_state_changed_precedes_changed() {
        let store = Arc::new(InMemorySessionStore::new());
        let (session, mut rx) = host_session(&store).await;

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.role(), SessionRole::Host);
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged(SessionState::Connected),
                SessionEvent::Changed
            ]
        );
    }

    #[tokio::test]
    async fn when_record_is_gone_refresh_reports_session_deleted() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut session, mut rx) = host_session(&store).await;
        drain(&mut rx);

        store.expire(session.id()).await;
        let result = session.refresh().await;

        assert!(matches!(result, Err(SessionError::SessionDeleted(_))));
        assert_eq!(session.state(), SessionState::Deleted);
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged(SessionState::Deleted),
                SessionEvent::Changed,
                SessionEvent::Deleted
            ]
        );
        assert!(matches!(
            session.refresh().await,
            Err(SessionError::SessionDeleted(_))
        ));
    }

    #[tokio::test]
    async fn when_client_asks_for_host_capability_then_forbidden() {
        let store = Arc::new(InMemorySessionStore::new());
        let (host, _rx) = host_session(&store).await;
        let mut client = client_session(&store, host.id(), "guest").await;

        assert_eq!(client.role(), SessionRole::Client);
        assert!(matches!(client.as_host(), Err(SessionError::Forbidden(_))));
        assert!(matches!(client.as_server(), Err(SessionError::Forbidden(_))));
    }

    #[tokio::test]
    async fn when_leaving_twice_then_invalid_operation() {
        let store = Arc::new(InMemorySessionStore::new());
        let (host, _rx) = host_session(&store).await;
        let mut client = client_session(&store, host.id(), "guest").await;
        let ctx_events = client.events().clone();
        let (_, mut rx) = ctx_events.subscribe_channel().await;

        client.leave().await.expect("leave");
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(!client.is_member());
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged(SessionState::Disconnected),
                SessionEvent::Changed,
                SessionEvent::RemovedFromSession
            ]
        );

        assert!(matches!(
            client.leave().await,
            Err(SessionError::InvalidOperation(_))
        ));
        // Leaving is not a lost feed; nothing reconnects
        assert!(matches!(
            client.reconnect().await,
            Err(SessionError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn when_server_leaves_the_record_is_deleted() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut server = Session::create(
            context(store.clone()),
            LocalIdentity::Server(pid("dedicated")),
            CreateSessionRequest::new("Hosted", 8),
        )
        .await
        .expect("server create");

        assert_eq!(server.role(), SessionRole::Server);
        assert!(server.players().is_empty());
        assert!(server.as_server().is_ok());

        server.leave().await.expect("leave as server");
        assert_eq!(server.state(), SessionState::Deleted);
        assert!(store.snapshot(server.id()).await.is_none());

        // Deleting again is a no-op
        server.delete().await.expect("second delete");
    }

    #[tokio::test]
    async fn when_reconnecting_while_connected_then_invalid_operation() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut session, _rx) = host_session(&store).await;
        assert!(matches!(
            session.reconnect().await,
            Err(SessionError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn when_feed_is_lost_background_reconnect_replaces_cache() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, mut rx) = host_session(&store).await;
        let id = host.id().clone();

        store.sever_subscriptions(&id).await;
        host.tick(Duration::from_millis(16)).await;
        assert_eq!(host.state(), SessionState::Disconnected);

        // Missed while disconnected
        let _guest = client_session(&store, &id, "guest").await;
        drain(&mut rx);

        host.tick(Duration::from_millis(50)).await;
        assert_eq!(host.state(), SessionState::Disconnected);
        host.tick(Duration::from_millis(60)).await;
        assert_eq!(host.state(), SessionState::Connected);
        assert_eq!(host.players().len(), 2);

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::PlayerJoined(pid("guest"))));
        assert!(events.contains(&SessionEvent::StateChanged(SessionState::Connected)));
    }

    #[tokio::test]
    async fn when_store_stays_offline_reconnect_gives_up() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, _rx) = host_session(&store).await;

        store.sever_subscriptions(host.id()).await;
        host.tick(Duration::from_millis(16)).await;
        store.set_offline(true);

        for _ in 0..20 {
            host.tick(Duration::from_millis(500)).await;
        }
        assert_eq!(host.state(), SessionState::Disconnected);
        assert!(!host.reconnect_schedule.armed);

        store.set_offline(false);
        host.reconnect().await.expect("manual reconnect");
        assert_eq!(host.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn when_kicked_then_removed_from_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, _rx) = host_session(&store).await;
        let mut client = client_session(&store, host.id(), "guest").await;
        let (_, mut client_rx) = client.events().subscribe_channel().await;

        host.as_host()
            .expect("host")
            .remove_player(&pid("guest"))
            .await
            .expect("kick");
        client.tick(Duration::from_millis(16)).await;

        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(!client.is_member());
        assert_eq!(
            drain(&mut client_rx).last(),
            Some(&SessionEvent::RemovedFromSession)
        );

        host.tick(Duration::from_millis(16)).await;
        assert_eq!(host.players().len(), 1);
    }

    #[tokio::test]
    async fn when_record_is_deleted_remotely_clients_see_deleted() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, _rx) = host_session(&store).await;
        let mut client = client_session(&store, host.id(), "guest").await;

        host.as_host().expect("host").delete().await.expect("delete");
        client.tick(Duration::from_millis(16)).await;

        assert_eq!(client.state(), SessionState::Deleted);
        assert!(matches!(
            client.leave().await,
            Err(SessionError::SessionDeleted(_))
        ));
    }

    #[tokio::test]
    async fn stale_snapshots_are_ignored() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, mut rx) = host_session(&store).await;
        let mut stale = host.record().clone();

        let mut as_host = host.as_host().expect("host");
        as_host
            .set_property("map", Some(Property::public("dunes")))
            .expect("stage");
        as_host.save_properties().await.expect("save");
        drain(&mut rx);

        stale.last_updated -= chrono::Duration::seconds(1);
        store
            .inject(host.id(), StoreNotification::RecordChanged { snapshot: stale })
            .await;
        host.tick(Duration::from_millis(16)).await;

        assert_eq!(host.property_value("map"), Some("dunes"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn roster_hint_without_snapshot_triggers_refresh() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, mut rx) = host_session(&store).await;
        let id = host.id().clone();

        // Only the hint reaches the host; the snapshot is lost
        let (tx, feed) = mpsc::unbounded_channel();
        host.subscription = Some(StoreSubscription::new(feed));
        store
            .join(&id, &pid("late"), JoinSessionRequest::default())
            .await
            .expect("join");
        drain(&mut rx);
        tx.send(StoreNotification::MemberJoined {
            player_id: pid("late"),
        })
        .expect("send hint");

        host.tick(Duration::from_millis(16)).await;

        assert!(host.player(&pid("late")).is_some());
        assert!(!host.needs_refresh);
        assert!(drain(&mut rx).contains(&SessionEvent::PlayerJoined(pid("late"))));
    }

    #[tokio::test]
    async fn shutdown_swallows_store_failures() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, _rx) = host_session(&store).await;
        store.set_offline(true);

        host.shutdown().await;
        // The feed could not be restored either
        assert_eq!(host.state(), SessionState::Disconnected);
        assert!(host.is_member());
    }

    #[tokio::test]
    async fn when_join_transport_fails_error_is_surfaced() {
        let mut store = MockSessionStorePort::new();
        store
            .expect_join()
            .returning(|_, _, _| Err(StoreError::Unavailable));
        let result = Session::join(
            context(Arc::new(store)),
            LocalIdentity::Player(pid("guest")),
            &SessionId::new("s-1").expect("valid session id"),
            JoinSessionRequest::default(),
        )
        .await;

        assert!(matches!(result, Err(e) if e.is_transport()));
    }

    #[tokio::test]
    async fn when_subscribe_fails_after_join_membership_is_released() {
        let mut store = MockSessionStorePort::new();
        let now = chrono::Utc::now();
        let record = SessionRecord {
            id: SessionId::new("s-1").expect("valid session id"),
            name: "Lobby".into(),
            code: None,
            host_id: pid("host"),
            max_players: 4,
            is_private: false,
            is_locked: false,
            has_password: false,
            created: now,
            last_updated: now,
            properties: PropertyMap::new(),
            members: vec![
                MemberRecord::new(pid("host"), PropertyMap::new(), now),
                MemberRecord::new(pid("guest"), PropertyMap::new(), now),
            ],
        };
        store
            .expect_join()
            .returning(move |_, _, _| Ok(record.clone()));
        store
            .expect_subscribe()
            .returning(|_, _| Err(StoreError::Unavailable));
        store
            .expect_remove_member()
            .withf(|_, player| player.as_str() == "guest")
            .times(1)
            .returning(|_, _| Ok(()));

        let result = Session::join(
            context(Arc::new(store)),
            LocalIdentity::Player(pid("guest")),
            &SessionId::new("s-1").expect("valid session id"),
            JoinSessionRequest::default(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::Transport(StoreError::Unavailable))));
    }

    fn lobby_record(host: &str, members: &[&str]) -> SessionRecord {
        let now = chrono::Utc::now();
        SessionRecord {
            id: SessionId::new("s-1").expect("valid session id"),
            name: "Lobby".into(),
            code: None,
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
                .map(|id| MemberRecord::new(pid(id), PropertyMap::new(), now))
                .collect(),
        }
    }

    type Feeds = Arc<std::sync::Mutex<Vec<mpsc::UnboundedSender<StoreNotification>>>>;

    /// A subscription whose sending side stays observable from the test.
    fn tracked_feed(feeds: &Feeds) -> StoreSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        feeds.lock().expect("feeds lock").push(tx);
        StoreSubscription::new(rx)
    }

    fn all_closed(feeds: &Feeds) -> bool {
        feeds
            .lock()
            .expect("feeds lock")
            .iter()
            .all(|tx| tx.is_closed())
    }

    #[tokio::test]
    async fn when_leaving_feed_is_closed_before_member_is_removed() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let feeds: Feeds = Arc::default();
        let closed_first = Arc::new(AtomicBool::new(false));
        let record = lobby_record("host", &["host", "guest"]);
        let mut seq = mockall::Sequence::new();
        let mut store = MockSessionStorePort::new();

        let joined = record.clone();
        store
            .expect_join()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, _| Ok(joined.clone()));
        let subscribed = Arc::clone(&feeds);
        store
            .expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(tracked_feed(&subscribed)));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(record.clone()));
        let removed = Arc::clone(&feeds);
        let flag = Arc::clone(&closed_first);
        store
            .expect_remove_member()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| {
                flag.store(all_closed(&removed), Ordering::SeqCst);
                Ok(())
            });

        let mut guest = Session::join(
            context(Arc::new(store)),
            LocalIdentity::Player(pid("guest")),
            &SessionId::new("s-1").expect("valid session id"),
            JoinSessionRequest::default(),
        )
        .await
        .expect("join");
        guest.leave().await.expect("leave");

        assert!(closed_first.load(Ordering::SeqCst));
        assert_eq!(guest.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn when_server_deletes_feed_is_closed_before_delete() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let feeds: Feeds = Arc::default();
        let closed_first = Arc::new(AtomicBool::new(false));
        let record = lobby_record("dedicated", &[]);
        let mut seq = mockall::Sequence::new();
        let mut store = MockSessionStorePort::new();

        let created = record.clone();
        store
            .expect_create()
            .withf(|_, request| request.server_hosted && request.member_properties.is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(created.clone()));
        let subscribed = Arc::clone(&feeds);
        store
            .expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(tracked_feed(&subscribed)));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(record.clone()));
        let deleted = Arc::clone(&feeds);
        let flag = Arc::clone(&closed_first);
        store
            .expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| {
                flag.store(all_closed(&deleted), Ordering::SeqCst);
                Ok(())
            });

        let mut server = Session::create(
            context(Arc::new(store)),
            LocalIdentity::Server(pid("dedicated")),
            CreateSessionRequest::new("Hosted", 4).with_member_properties(
                [("name".to_string(), Property::public("ignored"))]
                    .into_iter()
                    .collect(),
            ),
        )
        .await
        .expect("create");
        server
            .as_server()
            .expect("server")
            .delete()
            .await
            .expect("delete");

        assert!(closed_first.load(Ordering::SeqCst));
        assert_eq!(server.state(), SessionState::Deleted);
    }

    #[tokio::test]
    async fn when_leave_fails_restored_feed_catches_up() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let feeds: Feeds = Arc::default();
        let record = lobby_record("host", &["host", "guest"]);
        let mut changed = record.clone();
        changed.last_updated += chrono::Duration::seconds(1);
        changed
            .properties
            .insert("map".into(), Property::public("dunes"));

        let mut store = MockSessionStorePort::new();
        let joined = record.clone();
        store
            .expect_join()
            .times(1)
            .returning(move |_, _, _| Ok(joined.clone()));
        let subscribed = Arc::clone(&feeds);
        store
            .expect_subscribe()
            .times(2)
            .returning(move |_, _| Ok(tracked_feed(&subscribed)));
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        store.expect_get().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(record.clone())
            } else {
                // Written while the feed was down
                Ok(changed.clone())
            }
        });
        store
            .expect_remove_member()
            .times(1)
            .returning(|_, _| Err(StoreError::Unavailable));

        let mut guest = Session::join(
            context(Arc::new(store)),
            LocalIdentity::Player(pid("guest")),
            &SessionId::new("s-1").expect("valid session id"),
            JoinSessionRequest::default(),
        )
        .await
        .expect("join");
        let (_, mut rx) = guest.events().subscribe_channel().await;

        assert!(matches!(
            guest.leave().await,
            Err(SessionError::Transport(StoreError::Unavailable))
        ));
        assert_eq!(guest.state(), SessionState::Connected);
        assert!(guest.is_member());
        assert!(guest.subscription.is_some());
        assert_eq!(guest.property_value("map"), Some("dunes"));
        assert!(drain(&mut rx).contains(&SessionEvent::SessionPropertiesChanged));
    }

    #[tokio::test]
    async fn when_record_expires_while_disconnected_reconnect_reports_deleted() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, mut rx) = host_session(&store).await;
        let id = host.id().clone();

        store.sever_subscriptions(&id).await;
        host.tick(Duration::from_millis(16)).await;
        assert_eq!(host.state(), SessionState::Disconnected);

        store.expire(&id).await;
        drain(&mut rx);

        assert!(matches!(
            host.reconnect().await,
            Err(SessionError::SessionDeleted(_))
        ));
        assert_eq!(host.state(), SessionState::Deleted);
        assert!(drain(&mut rx).contains(&SessionEvent::Deleted));
        assert!(!host.reconnect_schedule.armed);
    }

    #[tokio::test]
    async fn unsynced_feed_triggers_refresh() {
        let store = Arc::new(InMemorySessionStore::new());
        let (mut host, mut rx) = host_session(&store).await;
        let id = host.id().clone();

        // The join snapshot never reaches the host
        let (tx, feed) = mpsc::unbounded_channel();
        host.subscription = Some(StoreSubscription::new(feed));
        store
            .join(&id, &pid("late"), JoinSessionRequest::default())
            .await
            .expect("join");
        drain(&mut rx);

        host.tick(Duration::from_millis(16)).await;
        assert!(host.player(&pid("late")).is_none());

        tx.send(StoreNotification::ConnectionStateChanged {
            state: SubscriptionState::Unsynced,
        })
        .expect("send state");
        host.tick(Duration::from_millis(16)).await;

        assert!(host.player(&pid("late")).is_some());
        assert!(drain(&mut rx).contains(&SessionEvent::PlayerJoined(pid("late"))));
    }

    #[tokio::test]
    async fn when_removed_between_join_and_subscribe_join_fails() {
        let feeds: Feeds = Arc::default();
        let joined = lobby_record("host", &["host", "guest"]);
        let kicked = lobby_record("host", &["host"]);
        let mut store = MockSessionStorePort::new();
        store
            .expect_join()
            .times(1)
            .returning(move |_, _, _| Ok(joined.clone()));
        let subscribed = Arc::clone(&feeds);
        store
            .expect_subscribe()
            .times(1)
            .returning(move |_, _| Ok(tracked_feed(&subscribed)));
        store
            .expect_get()
            .times(1)
            .returning(move |_| Ok(kicked.clone()));
        store.expect_remove_member().never();

        let result = Session::join(
            context(Arc::new(store)),
            LocalIdentity::Player(pid("guest")),
            &SessionId::new("s-1").expect("valid session id"),
            JoinSessionRequest::default(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::InvalidOperation(_))));
        assert!(all_closed(&feeds));
    }
}
