//! Host keep-alive scheduling
//!
//! Elapsed tick time accumulates only while no heartbeat is in flight. The
//! accumulator resets when a call is dispatched, not when it completes, and
//! the busy flag is cleared by the background task once the call resolves.
//! Failures are logged and never end the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use lobbysync_domain::SessionId;

use crate::ports::outbound::SessionStorePort;

#[derive(Debug)]
pub struct HeartbeatScheduler {
    period: Duration,
    handshake_period: Duration,
    accelerated: bool,
    elapsed: Duration,
    busy: Arc<AtomicBool>,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration, handshake_period: Duration) -> Self {
        Self {
            period,
            handshake_period,
            accelerated: false,
            elapsed: Duration::ZERO,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch to the shorter period used while the start handshake runs.
    pub fn accelerate(&mut self) {
        self.accelerated = true;
    }

    pub fn period(&self) -> Duration {
        if self.accelerated {
            self.handshake_period
        } else {
            self.period
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Advance the accumulator by `dt`; true when a heartbeat is due now.
    pub fn advance(&mut self, dt: Duration) -> bool {
        if self.is_busy() {
            return false;
        }
        self.elapsed += dt;
        if self.elapsed < self.period() {
            return false;
        }
        self.elapsed = Duration::ZERO;
        true
    }

    /// Advance and, when due, send one heartbeat in the background.
    ///
    /// Returns whether a call was dispatched.
    pub fn tick(
        &mut self,
        dt: Duration,
        store: &Arc<dyn SessionStorePort>,
        session_id: &SessionId,
    ) -> bool {
        if !self.advance(dt) {
            return false;
        }

        self.busy.store(true, Ordering::SeqCst);
        let busy = Arc::clone(&self.busy);
        let store = Arc::clone(store);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            match store.heartbeat(&session_id).await {
                Ok(()) => debug!(session_id = %session_id, "Heartbeat sent"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Heartbeat failed"),
            }
            busy.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Forget accumulated time; the next heartbeat is a full period away.
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.accelerated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::testing::InMemorySessionStore;
    use crate::ports::outbound::{MockSessionStorePort, StoreError};
    use lobbysync_domain::PlayerId;
    use lobbysync_shared::CreateSessionRequest;
    use tokio::sync::Semaphore;

    const PERIOD: Duration = Duration::from_secs(15);
    const HANDSHAKE: Duration = Duration::from_secs(5);

    fn session_id() -> SessionId {
        SessionId::new("s-1").expect("valid session id")
    }

    async fn wait_until_idle(scheduler: &HeartbeatScheduler) {
        for _ in 0..100 {
            if !scheduler.is_busy() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("heartbeat never completed");
    }

    #[test]
    fn test_accumulator_resets_at_dispatch() {
        let mut scheduler = HeartbeatScheduler::new(PERIOD, HANDSHAKE);
        assert!(!scheduler.advance(Duration::from_secs(10)));
        assert!(scheduler.advance(Duration::from_secs(6)));
        assert_eq!(scheduler.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_accelerated_period() {
        let mut scheduler = HeartbeatScheduler::new(PERIOD, HANDSHAKE);
        scheduler.accelerate();
        assert_eq!(scheduler.period(), HANDSHAKE);
        assert!(scheduler.advance(Duration::from_secs(5)));
        scheduler.reset();
        assert_eq!(scheduler.period(), PERIOD);
    }

    #[tokio::test]
    async fn test_only_one_heartbeat_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(InMemorySessionStore::new().with_heartbeat_gate(Arc::clone(&gate)));
        let record = store
            .create(
                &PlayerId::new("host").expect("valid player id"),
                CreateSessionRequest::new("Lobby", 4),
            )
            .await
            .expect("create");
        let port: Arc<dyn SessionStorePort> = store.clone();

        let mut scheduler = HeartbeatScheduler::new(PERIOD, HANDSHAKE);

        assert!(scheduler.tick(Duration::from_secs(16), &port, &record.id));
        assert!(scheduler.is_busy());
        tokio::task::yield_now().await;

        // Time passes again before the first call resolves
        assert!(!scheduler.tick(Duration::from_secs(16), &port, &record.id));
        assert!(!scheduler.tick(Duration::from_secs(16), &port, &record.id));
        tokio::task::yield_now().await;
        assert_eq!(store.heartbeat_count(), 1);

        gate.add_permits(1);
        wait_until_idle(&scheduler).await;
        assert_eq!(store.heartbeat_count(), 1);

        // Nothing accumulated while busy, so a full period is needed again
        assert!(!scheduler.tick(Duration::from_secs(10), &port, &record.id));
        assert!(scheduler.tick(Duration::from_secs(6), &port, &record.id));
        gate.add_permits(1);
        wait_until_idle(&scheduler).await;
        assert_eq!(store.heartbeat_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_heartbeat_clears_busy_flag() {
        let mut store = MockSessionStorePort::new();
        store
            .expect_heartbeat()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable));
        let store: Arc<dyn SessionStorePort> = Arc::new(store);

        let mut scheduler = HeartbeatScheduler::new(PERIOD, HANDSHAKE);
        assert!(scheduler.tick(PERIOD, &store, &session_id()));
        wait_until_idle(&scheduler).await;
        assert!(!scheduler.is_busy());
    }
}
