//! Resource Loader Port - the shared scene/resource loaded at game start
//!
//! Loading runs in the background once begun; activation is a separate step
//! so the engine can hold it until the join is confirmed.

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No load in progress")]
    NotStarted,
    #[error("A load is already running for {0}")]
    AlreadyLoading(String),
    #[error("Load failed: {0}")]
    Failed(String),
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait ResourceLoaderPort: Send + Sync {
    /// Start loading `resource` without activating it.
    fn begin(&self, resource: &str) -> Result<(), LoadError>;

    /// Load progress in `0.0..=1.0`.
    fn progress(&self) -> f32;

    /// Switch to the loaded resource.
    fn activate(&self) -> Result<(), LoadError>;

    /// Cancel a pending load and release what was loaded so far.
    fn abort(&self);
}
