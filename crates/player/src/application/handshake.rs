//! Start-game handshake
//!
//! Host: allocate a relay endpoint, publish `started` and the join code in
//! one update, then load the shared resource and activate it at the
//! threshold without waiting for anyone.
//!
//! Client: each tick the local mirror is checked. Once `started` is seen the
//! handshake leaves `Idle` for good. With a join code present the load
//! begins gated and one relay join is spawned; success releases the gate,
//! failure leaves the session and aborts the load. A `started` marker
//! without a join code is not yet actionable.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lobbysync_domain::{Property, SessionEvent, SessionState, StartPhase};
use lobbysync_shared::keys;

use crate::application::error::SessionError;
use crate::application::load_gate::LoadGate;
use crate::application::session::Session;
use crate::infrastructure::messaging::EventBus;
use crate::ports::outbound::{RelayError, RelayPort, ResourceLoaderPort};

pub struct StartHandshake {
    relay: Arc<dyn RelayPort>,
    loader: Arc<dyn ResourceLoaderPort>,
    events: EventBus,
    resource: String,
    threshold: f32,
    phase: StartPhase,
    gate: Option<LoadGate>,
    pending_join: Option<JoinHandle<Result<(), RelayError>>>,
}

impl StartHandshake {
    pub fn new(
        relay: Arc<dyn RelayPort>,
        loader: Arc<dyn ResourceLoaderPort>,
        events: EventBus,
        resource: impl Into<String>,
        threshold: f32,
    ) -> Self {
        Self {
            relay,
            loader,
            events,
            resource: resource.into(),
            threshold,
            phase: StartPhase::Idle,
            gate: None,
            pending_join: None,
        }
    }

    pub fn phase(&self) -> &StartPhase {
        &self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == StartPhase::Active
    }

    /// Start the game as host.
    pub async fn start_as_host(&mut self, session: &mut Session) -> Result<(), SessionError> {
        if self.phase != StartPhase::Idle {
            return Err(SessionError::invalid_operation(format!(
                "start already attempted ({:?})",
                self.phase
            )));
        }
        if !session.is_host() {
            return Err(SessionError::forbidden(format!(
                "{} is not the host of session {}",
                session.identity().id(),
                session.id()
            )));
        }
        if !session.can_start() {
            return Err(SessionError::invalid_operation(
                "session cannot start: not everyone is ready",
            ));
        }

        let endpoint = self.relay.allocate(session.record().max_players).await?;
        info!(session_id = %session.id(), join_code = %endpoint.join_code, "Relay endpoint allocated");

        // Nothing is published until the load is running, so a failed
        // begin leaves the lobby untouched and the start can be retried.
        let gate = LoadGate::begin(Arc::clone(&self.loader), &self.resource, self.threshold, false)
            .inspect_err(|e| {
                warn!(session_id = %session.id(), error = %e, "Shared load could not begin");
            })?;

        if let Err(e) = Self::publish_start(session, endpoint.join_code).await {
            warn!(session_id = %session.id(), error = %e, "Publishing the start failed");
            gate.abort();
            session.local_mut().clear_pending();
            if let Err(e) = session.refresh().await {
                debug!(error = %e, "Refresh after failed start also failed");
            }
            return Err(e);
        }
        session.accelerate_heartbeat();

        self.gate = Some(gate);
        self.set_phase(StartPhase::Loading { confirmed: true }).await;
        Ok(())
    }

    /// `started`, the join code and the lock go out in one update.
    async fn publish_start(session: &mut Session, join_code: String) -> Result<(), SessionError> {
        let mut host = session.as_host()?;
        host.set_properties([
            (keys::STARTED, Some(Property::public(keys::FLAG_TRUE))),
            (keys::JOIN_CODE, Some(Property::public(join_code))),
        ])?;
        host.set_locked(true);
        host.save_properties().await?;
        Ok(())
    }

    /// Advance the handshake against the current mirror.
    pub async fn tick(&mut self, session: &mut Session) {
        if self.phase.is_terminal() {
            return;
        }
        if self.phase != StartPhase::Idle && !Self::still_attached(session) {
            self.abort(format!("session is {}", session.state())).await;
            return;
        }

        match self.phase.clone() {
            StartPhase::Idle => {
                if session.state() == SessionState::Connected
                    && !session.is_host()
                    && session.is_started()
                {
                    info!(session_id = %session.id(), "Session started by host");
                    self.set_phase(StartPhase::AwaitingEndpoint).await;
                    self.begin_join(session).await;
                }
            }
            StartPhase::AwaitingEndpoint => self.begin_join(session).await,
            StartPhase::Joining { .. } => self.poll_join(session).await,
            StartPhase::Loading { .. } => self.poll_load().await,
            StartPhase::Active | StartPhase::Aborted { .. } => {}
        }
    }

    /// Stop whatever is in flight. No-op once terminal.
    pub async fn abort(&mut self, reason: impl Into<String>) {
        if self.phase.is_terminal() {
            return;
        }
        let reason = reason.into();
        if let Some(handle) = self.pending_join.take() {
            handle.abort();
        }
        if let Some(gate) = self.gate.take() {
            gate.abort();
        }
        if self.phase == StartPhase::Idle {
            return;
        }
        warn!(reason = %reason, "Start handshake aborted");
        self.set_phase(StartPhase::Aborted { reason }).await;
    }

    fn still_attached(session: &Session) -> bool {
        match session.state() {
            SessionState::Deleted | SessionState::None => false,
            _ => session.is_member() || session.identity().is_server(),
        }
    }

    async fn begin_join(&mut self, session: &mut Session) {
        let Some(join_code) = session.join_code().map(str::to_string) else {
            debug!(session_id = %session.id(), "Started without a join code yet");
            return;
        };

        match LoadGate::begin(Arc::clone(&self.loader), &self.resource, self.threshold, true) {
            Ok(gate) => self.gate = Some(gate),
            Err(e) => {
                self.fail_join(session, format!("shared load could not begin: {}", e))
                    .await;
                return;
            }
        }

        let relay = Arc::clone(&self.relay);
        let code = join_code.clone();
        self.pending_join = Some(tokio::spawn(async move { relay.join(&code).await }));
        info!(session_id = %session.id(), join_code = %join_code, "Joining relay endpoint");
        self.set_phase(StartPhase::Joining { join_code }).await;
    }

    async fn poll_join(&mut self, session: &mut Session) {
        let Some(handle) = self.pending_join.as_mut() else {
            return;
        };
        let Some(joined) = handle.now_or_never() else {
            return;
        };
        self.pending_join = None;

        match joined {
            Ok(Ok(())) => {
                if let Some(gate) = self.gate.as_mut() {
                    gate.confirm();
                }
                info!(session_id = %session.id(), "Relay joined, load released");
                self.set_phase(StartPhase::Loading { confirmed: true }).await;
                self.poll_load().await;
            }
            Ok(Err(e)) => {
                self.fail_join(session, format!("relay join failed: {}", e))
                    .await
            }
            Err(e) => {
                self.fail_join(session, format!("relay join task failed: {}", e))
                    .await
            }
        }
    }

    async fn poll_load(&mut self) {
        let Some(gate) = self.gate.as_mut() else {
            return;
        };
        match gate.poll() {
            Ok(true) => {
                self.gate = None;
                self.set_phase(StartPhase::Active).await;
            }
            Ok(false) => {}
            Err(e) => self.abort(format!("activation failed: {}", e)).await,
        }
    }

    /// A client that cannot reach the endpoint leaves rather than hold a
    /// half-initialized load.
    async fn fail_join(&mut self, session: &mut Session, reason: String) {
        if let Err(e) = session.leave().await {
            warn!(session_id = %session.id(), error = %e, "Leaving after failed join also failed");
        }
        self.abort(reason).await;
    }

    async fn set_phase(&mut self, next: StartPhase) {
        debug!(from = ?self.phase, to = ?next, "Start phase changed");
        self.phase = next.clone();
        self.events
            .dispatch(SessionEvent::StartPhaseChanged(next))
            .await;
    }
}
