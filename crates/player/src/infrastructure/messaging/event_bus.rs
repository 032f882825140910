//! Event Bus for session events.
//!
//! Push-based subscription: listeners register callbacks that are invoked
//! for every `SessionEvent`, in the exact order the session raised them.
//! A listener can also be a channel for consumers that prefer to poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use lobbysync_domain::SessionEvent;

/// Handle returned by [`EventBus::subscribe`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&SessionEvent) + Send + 'static>;

/// Event bus for session events.
///
/// The bus holds strong references to listeners, so they persist until
/// explicitly removed or the bus is dropped. Clones share the same listeners.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new EventBus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to all events.
    pub async fn subscribe(
        &self,
        callback: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().await.push((id, Box::new(callback)));
        id
    }

    /// Subscribe through an unbounded channel.
    ///
    /// The listener stays registered after the receiver is dropped; call
    /// [`EventBus::unsubscribe`] with the returned id to remove it.
    pub async fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(move |event| {
                let _ = tx.send(event.clone());
            })
            .await;
        (id, rx)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Dispatch one event to all listeners.
    pub async fn dispatch(&self, event: SessionEvent) {
        let mut listeners = self.listeners.lock().await;
        for (_, listener) in listeners.iter_mut() {
            listener(&event);
        }
    }

    /// Dispatch a batch while holding the lock, so batches from different
    /// tasks never interleave.
    pub async fn dispatch_all(&self, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        let mut listeners = self.listeners.lock().await;
        for event in &events {
            for (_, listener) in listeners.iter_mut() {
                listener(event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_subscribe_and_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));

        let count_clone = Arc::clone(&count);
        bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.dispatch(SessionEvent::Changed).await;
        bus.dispatch(SessionEvent::Deleted).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));

        let count_clone = Arc::clone(&count);
        let id = bus
            .subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        bus.dispatch(SessionEvent::Changed).await;
        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        bus.dispatch(SessionEvent::Changed).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel().await;

        bus.dispatch_all(vec![
            SessionEvent::SessionPropertiesChanged,
            SessionEvent::RemovedFromSession,
            SessionEvent::Changed,
        ])
        .await;

        assert_eq!(rx.try_recv().ok(), Some(SessionEvent::SessionPropertiesChanged));
        assert_eq!(rx.try_recv().ok(), Some(SessionEvent::RemovedFromSession));
        assert_eq!(rx.try_recv().ok(), Some(SessionEvent::Changed));
        assert!(rx.try_recv().is_err());
    }
}
