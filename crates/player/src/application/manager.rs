//! Top-level session management
//!
//! `SessionManager` owns the current `Session` and its start handshake, and
//! is the single place where sessions are created, joined and torn down.
//! Consumers talk to it instead of reaching for a global "current session".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use lobbysync_domain::{PlayerId, Property, PropertyMap, SessionEvent, SessionId, StartPhase};
use lobbysync_shared::{keys, CreateSessionRequest, JoinSessionRequest};

use crate::application::error::{SessionError, WriteOutcome};
use crate::application::handshake::StartHandshake;
use crate::application::session::{LocalIdentity, Session, SessionContext};
use crate::infrastructure::config::SessionConfig;
use crate::infrastructure::messaging::{
    new_shared_state, EventBus, ListenerId, SessionStateObserver,
};
use crate::ports::outbound::{RelayPort, ResourceLoaderPort, SessionStorePort};

/// Lobby settings the host may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LobbySettings {
    pub name: Option<String>,
    pub max_players: Option<u32>,
    pub is_private: Option<bool>,
}

pub struct SessionManager {
    context: SessionContext,
    relay: Arc<dyn RelayPort>,
    loader: Arc<dyn ResourceLoaderPort>,
    identity: LocalIdentity,
    session: Option<Session>,
    handshake: StartHandshake,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStorePort>,
        relay: Arc<dyn RelayPort>,
        loader: Arc<dyn ResourceLoaderPort>,
        identity: LocalIdentity,
        config: SessionConfig,
    ) -> Self {
        let context = SessionContext {
            store,
            events: EventBus::new(),
            state: new_shared_state(),
            config,
        };
        let handshake = Self::handshake_for(&context, &relay, &loader);
        Self {
            context,
            relay,
            loader,
            identity,
            session: None,
            handshake,
        }
    }

    fn handshake_for(
        context: &SessionContext,
        relay: &Arc<dyn RelayPort>,
        loader: &Arc<dyn ResourceLoaderPort>,
    ) -> StartHandshake {
        StartHandshake::new(
            Arc::clone(relay),
            Arc::clone(loader),
            context.events.clone(),
            context.config.scene.clone(),
            context.config.activation_threshold,
        )
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn player_id(&self) -> &PlayerId {
        self.identity.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.context.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn start_phase(&self) -> &StartPhase {
        self.handshake.phase()
    }

    pub fn state_observer(&self) -> SessionStateObserver {
        SessionStateObserver::new(Arc::clone(&self.context.state))
    }

    pub async fn subscribe(
        &self,
        callback: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> ListenerId {
        self.context.events.subscribe(callback).await
    }

    pub async fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.context.events.subscribe_channel().await
    }

    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.context.events.unsubscribe(id).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a lobby and become its host (or its server).
    pub async fn create_session(
        &mut self,
        request: CreateSessionRequest,
        display_name: &str,
    ) -> Result<&Session, SessionError> {
        self.ensure_free()?;
        let mut request = request;
        if !self.identity.is_server() {
            let mut member_properties = initial_member_properties(display_name);
            member_properties.extend(request.member_properties);
            request.member_properties = member_properties;
        }

        let session =
            Session::create(self.context.clone(), self.identity.clone(), request).await?;
        Ok(self.install(session))
    }

    pub async fn join_session(
        &mut self,
        session_id: &SessionId,
        display_name: &str,
        password: Option<String>,
    ) -> Result<&Session, SessionError> {
        self.ensure_free()?;
        let request = JoinSessionRequest {
            member_properties: initial_member_properties(display_name),
            password,
        };
        let session = Session::join(
            self.context.clone(),
            self.identity.clone(),
            session_id,
            request,
        )
        .await?;
        Ok(self.install(session))
    }

    /// Change lobby settings as host and save them.
    pub async fn update_session(
        &mut self,
        settings: LobbySettings,
    ) -> Result<WriteOutcome, SessionError> {
        let session = self.current_mut()?;
        let mut host = session.as_host()?;
        if let Some(name) = settings.name {
            host.set_name(name)?;
        }
        if let Some(max_players) = settings.max_players {
            host.set_max_players(max_players)?;
        }
        if let Some(is_private) = settings.is_private {
            host.set_private(is_private);
        }
        host.save_properties().await
    }

    pub async fn set_ready(&mut self, ready: bool) -> Result<WriteOutcome, SessionError> {
        self.current_mut()?.set_ready(ready).await
    }

    pub fn is_everyone_ready(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_everyone_ready)
    }

    pub fn can_start(&self) -> bool {
        self.session.as_ref().is_some_and(Session::can_start)
    }

    /// Start the game as host.
    pub async fn start_game(&mut self) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Err(no_session());
        };
        self.handshake.start_as_host(session).await
    }

    /// One frame: session first so the handshake sees the fresh mirror.
    pub async fn tick(&mut self, dt: Duration) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.tick(dt).await;
        self.handshake.tick(session).await;
    }

    pub async fn leave(&mut self) -> Result<(), SessionError> {
        let session = self.current_mut()?;
        session.leave().await?;
        self.handshake.abort("left the session").await;
        Ok(())
    }

    /// Delete the lobby as host or server.
    pub async fn delete(&mut self) -> Result<(), SessionError> {
        let session = self.current_mut()?;
        session.as_host()?.delete().await?;
        self.handshake.abort("session deleted").await;
        Ok(())
    }

    /// Best-effort leave, for process exit.
    pub async fn shutdown(&mut self) {
        self.handshake.abort("shutting down").await;
        if let Some(session) = self.session.as_mut() {
            session.shutdown().await;
        }
    }

    fn current_mut(&mut self) -> Result<&mut Session, SessionError> {
        self.session.as_mut().ok_or_else(no_session)
    }

    fn ensure_free(&self) -> Result<(), SessionError> {
        match &self.session {
            Some(session) if session.state().is_connected() || session.is_member() => {
                Err(SessionError::invalid_operation(format!(
                    "already in session {}",
                    session.id()
                )))
            }
            _ => Ok(()),
        }
    }

    fn install(&mut self, session: Session) -> &Session {
        if self.session.is_some() {
            warn!("Replacing a finished session");
        }
        info!(
            session_id = %session.id(),
            role = %session.role(),
            players = session.players().len(),
            "Session ready"
        );
        self.handshake = Self::handshake_for(&self.context, &self.relay, &self.loader);
        self.session.insert(session)
    }
}

fn no_session() -> SessionError {
    SessionError::invalid_operation("no active session")
}

/// Member data every participant starts with.
pub fn initial_member_properties(display_name: &str) -> PropertyMap {
    let mut properties = PropertyMap::new();
    properties.insert(keys::NAME.to_string(), Property::public(display_name));
    properties.insert(
        keys::READY.to_string(),
        Property::public(keys::FLAG_FALSE),
    );
    properties
}
