//! Host and server capability handles
//!
//! Host-only operations live on these borrowed views so a client cannot
//! reach them at all. Obtain them through [`Session::as_host`] and
//! [`Session::as_server`]; both check the role at the time of the call.

use lobbysync_domain::{DomainError, PlayerId, Property};

use crate::application::error::{SessionError, WriteOutcome};
use crate::application::session::Session;

pub struct HostSession<'a> {
    session: &'a mut Session,
}

impl<'a> HostSession<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &*self.session
    }

    // =========================================================================
    // Staged settings (sent by save_properties)
    // =========================================================================

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), SessionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("Session name cannot be empty").into());
        }
        self.session.local_mut().stage_name(name);
        Ok(())
    }

    /// Capacity may not drop below the current roster.
    pub fn set_max_players(&mut self, max_players: u32) -> Result<(), SessionError> {
        let members = self.session.players().len();
        if max_players == 0 || (max_players as usize) < members {
            return Err(DomainError::validation(format!(
                "max_players {} cannot hold {} members",
                max_players, members
            ))
            .into());
        }
        self.session.local_mut().stage_max_players(max_players);
        Ok(())
    }

    pub fn set_private(&mut self, is_private: bool) {
        self.session.local_mut().stage_private(is_private);
    }

    pub fn set_locked(&mut self, is_locked: bool) {
        self.session.local_mut().stage_locked(is_locked);
    }

    /// An empty password removes it.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.session.local_mut().stage_password(password.into());
    }

    /// Hand the host role to another member once saved.
    pub fn set_host(&mut self, player_id: PlayerId) -> Result<(), SessionError> {
        if self.session.player(&player_id).is_none() {
            return Err(SessionError::invalid_operation(format!(
                "{} is not a member of session {}",
                player_id,
                self.session.id()
            )));
        }
        self.session.local_mut().stage_host(player_id);
        Ok(())
    }

    /// Stage a session property; `None` removes the key.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        property: Option<Property>,
    ) -> Result<(), SessionError> {
        let key = key.into();
        if key.is_empty() {
            return Err(DomainError::validation("Property key cannot be empty").into());
        }
        self.session.local_mut().stage_session_property(key, property);
        Ok(())
    }

    pub fn set_properties<I, K>(&mut self, properties: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = (K, Option<Property>)>,
        K: Into<String>,
    {
        for (key, property) in properties {
            self.set_property(key, property)?;
        }
        Ok(())
    }

    /// Stage a property on any member's data.
    pub fn set_player_property(
        &mut self,
        player_id: &PlayerId,
        key: impl Into<String>,
        property: Option<Property>,
    ) -> Result<(), SessionError> {
        self.session
            .stage_player_property(player_id, key.into(), property)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Send every staged session change in one update.
    pub async fn save_properties(&mut self) -> Result<WriteOutcome, SessionError> {
        self.session.save_session_properties().await
    }

    pub async fn save_player_data(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<WriteOutcome, SessionError> {
        self.session.save_player_data(player_id).await
    }

    pub async fn remove_player(&mut self, player_id: &PlayerId) -> Result<(), SessionError> {
        self.session.remove_player(player_id).await
    }

    pub async fn delete(self) -> Result<(), SessionError> {
        self.session.delete().await
    }
}

/// View for a dedicated server that hosts a record without being a member.
pub struct ServerSession<'a> {
    session: &'a mut Session,
}

impl<'a> ServerSession<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    /// Host operations; a server always holds host privileges.
    pub fn host(&mut self) -> HostSession<'_> {
        HostSession::new(self.session)
    }

    pub async fn delete(self) -> Result<(), SessionError> {
        self.session.delete().await
    }
}
