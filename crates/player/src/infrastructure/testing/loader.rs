//! Simulated resource loader.
//!
//! Progress advances by a fixed step every time it is polled, standing in
//! for a background load that keeps running between ticks.

use std::sync::{Mutex, MutexGuard};

use crate::ports::outbound::{LoadError, ResourceLoaderPort};

#[derive(Debug, Default)]
struct LoaderState {
    loading: Option<String>,
    progress: f32,
    activated: Option<String>,
    aborts: u32,
}

#[derive(Debug)]
pub struct SimulatedLoader {
    step: f32,
    state: Mutex<LoaderState>,
}

impl SimulatedLoader {
    /// `step` is the progress gained per poll.
    pub fn new(step: f32) -> Self {
        Self {
            step: step.clamp(0.0, 1.0),
            state: Mutex::new(LoaderState::default()),
        }
    }

    pub fn activated(&self) -> Option<String> {
        self.lock().activated.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading.is_some()
    }

    pub fn abort_count(&self) -> u32 {
        self.lock().aborts
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimulatedLoader {
    fn default() -> Self {
        Self::new(0.25)
    }
}

impl ResourceLoaderPort for SimulatedLoader {
    fn begin(&self, resource: &str) -> Result<(), LoadError> {
        let mut state = self.lock();
        if let Some(current) = &state.loading {
            return Err(LoadError::AlreadyLoading(current.clone()));
        }
        state.loading = Some(resource.to_string());
        state.progress = 0.0;
        Ok(())
    }

    fn progress(&self) -> f32 {
        let mut state = self.lock();
        if state.loading.is_none() {
            return 0.0;
        }
        let current = state.progress;
        state.progress = (state.progress + self.step).min(1.0);
        current
    }

    fn activate(&self) -> Result<(), LoadError> {
        let mut state = self.lock();
        let resource = state.loading.take().ok_or(LoadError::NotStarted)?;
        state.activated = Some(resource);
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.lock();
        if state.loading.take().is_some() {
            state.aborts += 1;
        }
        state.progress = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_advances_per_poll() {
        let loader = SimulatedLoader::new(0.5);
        loader.begin("Arena").expect("begin");
        assert_eq!(loader.progress(), 0.0);
        assert_eq!(loader.progress(), 0.5);
        assert_eq!(loader.progress(), 1.0);
        assert_eq!(loader.progress(), 1.0);
    }

    #[test]
    fn test_activate_and_abort() {
        let loader = SimulatedLoader::default();
        assert!(matches!(loader.activate(), Err(LoadError::NotStarted)));

        loader.begin("Arena").expect("begin");
        assert!(matches!(
            loader.begin("Other"),
            Err(LoadError::AlreadyLoading(_))
        ));
        loader.abort();
        assert_eq!(loader.abort_count(), 1);
        assert!(!loader.is_loading());

        loader.begin("Arena").expect("begin again");
        loader.activate().expect("activate");
        assert_eq!(loader.activated().as_deref(), Some("Arena"));
    }
}
