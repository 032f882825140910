//! Ports - interfaces the session engine depends on
//!
//! Only outbound ports exist: the engine is driven by direct calls on
//! `SessionManager` and by its own tick.

pub mod outbound;
