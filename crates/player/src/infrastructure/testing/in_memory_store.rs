//! In-memory session store.
//!
//! Behaves like the remote service closely enough to drive several local
//! sessions against one shared record: it issues ids and join codes, keeps
//! `last_updated` strictly increasing, delivers notifications to every
//! subscriber, migrates the host when the host leaves, and deletes a record
//! once its last member is gone. Test hooks can hold heartbeats, take the
//! service offline, sever subscriptions, or inject raw notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::debug;
use uuid::Uuid;

use lobbysync_domain::{MemberRecord, PlayerId, SessionId, SessionRecord};
use lobbysync_shared::{
    apply_property_update, CreateSessionRequest, JoinSessionRequest, StoreNotification,
    SubscriptionState, UpdateMemberRequest, UpdateSessionRequest,
};

use crate::ports::outbound::{SessionStorePort, StoreError, StoreSubscription};

struct StoredSession {
    record: SessionRecord,
    password: Option<String>,
    server_hosted: bool,
    subscribers: Vec<(PlayerId, mpsc::UnboundedSender<StoreNotification>)>,
}

impl StoredSession {
    fn notify(&mut self, notification: &StoreNotification) {
        self.subscribers
            .retain(|(_, tx)| tx.send(notification.clone()).is_ok());
    }

    fn notify_player(&mut self, player_id: &PlayerId, notification: &StoreNotification) {
        for (_, tx) in self.subscribers.iter().filter(|(id, _)| id == player_id) {
            let _ = tx.send(notification.clone());
        }
    }

    fn publish_snapshot(&mut self) {
        let snapshot = StoreNotification::RecordChanged {
            snapshot: self.record.clone(),
        };
        self.notify(&snapshot);
    }
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<SessionId, StoredSession>,
    last_stamp: Option<DateTime<Utc>>,
}

impl StoreState {
    /// Strictly increasing timestamps, even within one clock tick.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut StoredSession, StoreError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<StoreState>,
    heartbeat_gate: Option<Arc<Semaphore>>,
    heartbeats: AtomicUsize,
    offline: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every heartbeat waits for one permit from `gate` before it resolves.
    pub fn with_heartbeat_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.heartbeat_gate = Some(gate);
        self
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// While offline every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Option<SessionRecord> {
        let state = self.state.lock().await;
        state.sessions.get(session_id).map(|s| s.record.clone())
    }

    /// Close every subscription feed of a session without touching the record.
    pub async fn sever_subscriptions(&self, session_id: &SessionId) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.subscribers.clear();
        }
    }

    /// Deliver a raw notification to every subscriber of a session.
    pub async fn inject(&self, session_id: &SessionId, notification: StoreNotification) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.notify(&notification);
        }
    }

    /// Drop a record as the service does when its heartbeat lapses.
    pub async fn expire(&self, session_id: &SessionId) {
        let mut state = self.state.lock().await;
        if let Some(mut session) = state.sessions.remove(session_id) {
            debug!(session_id = %session_id, "Session expired");
            session.notify(&StoreNotification::RecordDeleted);
        }
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

fn short_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase()
}

fn bad_request(e: impl std::fmt::Display) -> StoreError {
    StoreError::Request(e.to_string())
}

#[async_trait]
impl SessionStorePort for InMemorySessionStore {
    async fn create(
        &self,
        owner: &PlayerId,
        request: CreateSessionRequest,
    ) -> Result<SessionRecord, StoreError> {
        self.ensure_online()?;
        request.validate().map_err(bad_request)?;

        let mut state = self.state.lock().await;
        let now = state.stamp();
        let id = SessionId::new(Uuid::new_v4().to_string()).map_err(bad_request)?;
        let members = if request.server_hosted {
            Vec::new()
        } else {
            vec![MemberRecord::new(
                owner.clone(),
                request.member_properties.clone(),
                now,
            )]
        };
        let password = request.password.filter(|p| !p.is_empty());

        let record = SessionRecord {
            id: id.clone(),
            name: request.name,
            code: Some(short_code()),
            host_id: owner.clone(),
            max_players: request.max_players,
            is_private: request.is_private,
            is_locked: request.is_locked,
            has_password: password.is_some(),
            created: now,
            last_updated: now,
            properties: request.properties,
            members,
        };

        state.sessions.insert(
            id,
            StoredSession {
                record: record.clone(),
                password,
                server_hosted: request.server_hosted,
                subscribers: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn get(&self, session_id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        Ok(state.session_mut(session_id)?.record.clone())
    }

    async fn join(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
        request: JoinSessionRequest,
    ) -> Result<SessionRecord, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let now = state.stamp();
        let session = state.session_mut(session_id)?;

        if session.record.contains_member(player_id) {
            return Ok(session.record.clone());
        }
        if session.record.is_locked {
            return Err(StoreError::Forbidden("session is locked".into()));
        }
        if session.record.available_slots() == 0 {
            return Err(StoreError::Forbidden("session is full".into()));
        }
        if session.password.is_some() && session.password != request.password {
            return Err(StoreError::Forbidden("wrong password".into()));
        }

        session.record.members.push(MemberRecord::new(
            player_id.clone(),
            request.member_properties,
            now,
        ));
        session.record.last_updated = now;

        session.notify(&StoreNotification::MemberJoined {
            player_id: player_id.clone(),
        });
        session.publish_snapshot();
        Ok(session.record.clone())
    }

    async fn update(
        &self,
        session_id: &SessionId,
        request: UpdateSessionRequest,
    ) -> Result<SessionRecord, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let now = state.stamp();
        let session = state.session_mut(session_id)?;
        let record = &mut session.record;

        if let Some(host_id) = &request.host_id {
            if !record.contains_member(host_id) {
                return Err(StoreError::Request(format!(
                    "host {} is not a member",
                    host_id
                )));
            }
        }
        if let Some(max_players) = request.max_players {
            if max_players == 0 || (max_players as usize) < record.members.len() {
                return Err(StoreError::Request(format!(
                    "max players {} is below the current player count",
                    max_players
                )));
            }
        }

        if let Some(name) = request.name {
            record.name = name;
        }
        if let Some(max_players) = request.max_players {
            record.max_players = max_players;
        }
        if let Some(is_private) = request.is_private {
            record.is_private = is_private;
        }
        if let Some(is_locked) = request.is_locked {
            record.is_locked = is_locked;
        }
        if let Some(host_id) = request.host_id {
            record.host_id = host_id;
        }
        if let Some(password) = request.password {
            record.has_password = !password.is_empty();
            session.password = Some(password).filter(|p| !p.is_empty());
        }
        apply_property_update(&mut session.record.properties, &request.properties);
        session.record.last_updated = now;

        session.publish_snapshot();
        Ok(session.record.clone())
    }

    async fn update_member(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
        request: UpdateMemberRequest,
    ) -> Result<SessionRecord, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let now = state.stamp();
        let session = state.session_mut(session_id)?;

        let member = session
            .record
            .members
            .iter_mut()
            .find(|m| &m.id == player_id)
            .ok_or_else(|| StoreError::MemberNotFound {
                session_id: session_id.clone(),
                player_id: player_id.clone(),
            })?;
        apply_property_update(&mut member.properties, &request.properties);
        member.last_updated = now;
        session.record.last_updated = now;

        session.publish_snapshot();
        Ok(session.record.clone())
    }

    async fn remove_member(
        &self,
        session_id: &SessionId,
        player_id: &PlayerId,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let now = state.stamp();
        let session = state.session_mut(session_id)?;

        if !session.record.contains_member(player_id) {
            return Err(StoreError::MemberNotFound {
                session_id: session_id.clone(),
                player_id: player_id.clone(),
            });
        }

        session.notify(&StoreNotification::MemberLeaving {
            player_id: player_id.clone(),
        });
        session.notify_player(player_id, &StoreNotification::Kicked);
        session.subscribers.retain(|(id, _)| id != player_id);

        session.record.members.retain(|m| &m.id != player_id);
        session.record.last_updated = now;

        if session.record.members.is_empty() && !session.server_hosted {
            debug!(session_id = %session_id, "Last member left, deleting session");
            session.notify(&StoreNotification::RecordDeleted);
            state.sessions.remove(session_id);
            return Ok(());
        }

        if &session.record.host_id == player_id {
            if let Some(next) = session.record.members.first() {
                session.record.host_id = next.id.clone();
            }
        }

        session.notify(&StoreNotification::MemberLeft {
            player_id: player_id.clone(),
        });
        session.publish_snapshot();
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let mut session = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        session.notify(&StoreNotification::RecordDeleted);
        Ok(())
    }

    async fn heartbeat(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.ensure_online()?;
        {
            let state = self.state.lock().await;
            if !state.sessions.contains_key(session_id) {
                return Err(StoreError::NotFound(session_id.clone()));
            }
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.heartbeat_gate {
            let permit = gate.acquire().await.map_err(|_| StoreError::Unavailable)?;
            permit.forget();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        subscriber: &PlayerId,
    ) -> Result<StoreSubscription, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StoreNotification::ConnectionStateChanged {
            state: SubscriptionState::Subscribed,
        });
        session.subscribers.push((subscriber.clone(), tx));
        Ok(StoreSubscription::new(rx))
    }
}
