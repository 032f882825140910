//! Threshold-gated activation of the shared resource load.
//!
//! The load runs in the background as soon as it begins. Activation happens
//! once progress reaches the threshold and, for gates that wait for
//! confirmation, after [`LoadGate::confirm`] was called.

use std::sync::Arc;

use tracing::{debug, info};

use crate::ports::outbound::{LoadError, ResourceLoaderPort};

pub struct LoadGate {
    loader: Arc<dyn ResourceLoaderPort>,
    resource: String,
    threshold: f32,
    confirmed: bool,
    activated: bool,
}

impl LoadGate {
    /// Begin loading `resource`. With `wait_for_confirmation` activation is
    /// held until [`LoadGate::confirm`].
    pub fn begin(
        loader: Arc<dyn ResourceLoaderPort>,
        resource: &str,
        threshold: f32,
        wait_for_confirmation: bool,
    ) -> Result<Self, LoadError> {
        loader.begin(resource)?;
        debug!(resource, wait_for_confirmation, "Shared load started");
        Ok(Self {
            loader,
            resource: resource.to_string(),
            threshold,
            confirmed: !wait_for_confirmation,
            activated: false,
        })
    }

    /// Release the activation gate.
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Activate when allowed. Returns true once the resource is active.
    pub fn poll(&mut self) -> Result<bool, LoadError> {
        if self.activated {
            return Ok(true);
        }
        let progress = self.loader.progress();
        if progress < self.threshold || !self.confirmed {
            return Ok(false);
        }
        self.loader.activate()?;
        self.activated = true;
        info!(resource = %self.resource, "Shared resource activated");
        Ok(true)
    }

    /// Cancel the load if it has not been activated yet.
    pub fn abort(self) {
        if !self.activated {
            self.loader.abort();
            info!(resource = %self.resource, "Shared load aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::outbound::MockResourceLoaderPort;

    fn loader_at(progress: f32) -> MockResourceLoaderPort {
        let mut loader = MockResourceLoaderPort::new();
        loader.expect_begin().times(1).returning(|_| Ok(()));
        loader.expect_progress().returning(move || progress);
        loader
    }

    #[test]
    fn when_below_threshold_does_not_activate() {
        let mut loader = loader_at(0.5);
        loader.expect_activate().never();
        let mut gate = LoadGate::begin(Arc::new(loader), "Arena", 0.9, false).expect("begin");
        assert!(!gate.poll().expect("poll"));
    }

    #[test]
    fn when_unconfirmed_waits_even_past_threshold() {
        let mut loader = loader_at(1.0);
        loader.expect_activate().times(1).returning(|| Ok(()));
        let mut gate = LoadGate::begin(Arc::new(loader), "Arena", 0.9, true).expect("begin");

        assert!(!gate.poll().expect("poll"));
        gate.confirm();
        assert!(gate.poll().expect("poll"));
        // Already active; no second activation
        assert!(gate.poll().expect("poll"));
    }

    #[test]
    fn abort_after_activation_is_a_no_op() {
        let mut loader = loader_at(0.95);
        loader.expect_activate().times(1).returning(|| Ok(()));
        loader.expect_abort().never();
        let mut gate = LoadGate::begin(Arc::new(loader), "Arena", 0.9, false).expect("begin");
        assert!(gate.poll().expect("poll"));
        gate.abort();
    }

    #[test]
    fn abort_before_activation_cancels_the_load() {
        let mut loader = loader_at(0.1);
        loader.expect_abort().times(1).return_const(());
        let gate = LoadGate::begin(Arc::new(loader), "Arena", 0.9, true).expect("begin");
        gate.abort();
    }
}
