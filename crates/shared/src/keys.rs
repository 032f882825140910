//! Well-known property keys of the lobby protocol.

/// Member property: display name of the player
pub const NAME: &str = "name";

/// Member property: `"1"` when the player is ready, `"0"` otherwise
pub const READY: &str = "ready";

/// Session property: `"1"` once the host has started the game
pub const STARTED: &str = "started";

/// Session property: relay join code published by the host
pub const JOIN_CODE: &str = "join_code";

/// Encoded value of a true flag property
pub const FLAG_TRUE: &str = "1";

/// Encoded value of a false flag property
pub const FLAG_FALSE: &str = "0";

/// Encode a boolean flag the way the lobby protocol stores it.
pub fn flag(value: bool) -> &'static str {
    if value {
        FLAG_TRUE
    } else {
        FLAG_FALSE
    }
}
