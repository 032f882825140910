//! Session Events
//!
//! Granular notifications raised by the local session view after it
//! reconciles a snapshot or changes state. Consumers (UI, game layer) receive
//! them in the order they were raised.
//!
//! ## Ordering
//!
//! For one incoming snapshot the order is always:
//! 1. `PlayerLeaving` / `PlayerHasLeft` pairs for removed members
//! 2. `PlayerJoined` for new members
//! 3. `SessionPropertiesChanged`, then `PlayerPropertiesChanged`
//! 4. `SessionHostChanged`
//! 5. `Changed`
//!
//! A state transition raises `StateChanged` immediately followed by `Changed`.

use serde::{Deserialize, Serialize};

use crate::entities::MemberRecord;
use crate::ids::PlayerId;
use crate::types::{SessionState, StartPhase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    /// Anything about the session changed (state, roster, properties)
    Changed,
    /// The session state changed to the given value
    StateChanged(SessionState),
    /// A member was added to the roster
    PlayerJoined(PlayerId),
    /// A member is about to be removed; carries its last known record
    PlayerLeaving {
        player_id: PlayerId,
        last_known: MemberRecord,
    },
    /// A member was removed from the roster
    PlayerHasLeft(PlayerId),
    /// Session-level properties changed (at most once per snapshot)
    SessionPropertiesChanged,
    /// Member-level properties changed (at most once per snapshot)
    PlayerPropertiesChanged { players: Vec<PlayerId> },
    /// The local player was removed from the session
    RemovedFromSession,
    /// The session record was deleted
    Deleted,
    /// The host id moved to another participant
    SessionHostChanged(PlayerId),
    /// The start-game handshake moved to a new phase
    StartPhaseChanged(StartPhase),
}
