pub mod backoff;
pub mod config;
pub mod messaging;

pub mod testing;

// Re-export commonly used infrastructure types
pub use backoff::{BackoffPolicy, BackoffState};
pub use config::{load_dotenv_from_repo_root, SessionConfig};
pub use messaging::{EventBus, ListenerId, SessionStateObserver};
