//! Persistent event subscriptions.
//!
//! A subscription registers interest in one event kind at the transport
//! and feeds a bounded channel. `notify` is the enqueue-only path used by
//! the receive context; it never blocks, and overflow drops the event and
//! counts it. `retire` cancels best-effort and wins any race with a slow
//! `issue`: once both settle the subscription is Retired, and a
//! registration that lands after retirement is unsubscribed immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use pfe_client::{Event, EventKind, PfeError, PfeResult, SubscriptionId, Transport};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created locally; registration not yet acknowledged.
    Issued,
    /// Registered at the transport and receiving events.
    Active,
    /// Cancelled; late events are discarded.
    Retired,
}

struct SubscriptionInner {
    state: SubscriptionState,
    id: Option<SubscriptionId>,
}

/// One registered interest in an event kind.
pub struct EventSubscription {
    kind: EventKind,
    sink: mpsc::Sender<Event>,
    dropped: AtomicU64,
    inner: Mutex<SubscriptionInner>,
}

impl EventSubscription {
    /// Creates a subscription feeding the given bounded channel.
    pub fn new(kind: EventKind, sink: mpsc::Sender<Event>) -> Self {
        Self {
            kind,
            sink,
            dropped: AtomicU64::new(0),
            inner: Mutex::new(SubscriptionInner {
                state: SubscriptionState::Issued,
                id: None,
            }),
        }
    }

    /// Returns the subscribed event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().expect("subscription lock poisoned").state
    }

    /// Returns the transport id once registration completed.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.inner.lock().expect("subscription lock poisoned").id
    }

    /// Returns the number of events dropped on channel overflow.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues one event for the issuing context.
    ///
    /// Returns immediately in all cases: a full channel drops the event
    /// and a retired subscription discards it.
    pub fn notify(&self, event: Event) -> bool {
        if self.state() == SubscriptionState::Retired {
            trace!("discarding event for retired subscription ({:?})", self.kind);
            return false;
        }
        match self.sink.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Registers the subscription at the transport.
    ///
    /// If a concurrent [`retire`](Self::retire) settled first, the late
    /// registration is cancelled on the spot and the subscription stays
    /// Retired.
    pub async fn issue(&self, transport: &dyn Transport) -> PfeResult<()> {
        {
            let inner = self.inner.lock().expect("subscription lock poisoned");
            if inner.state == SubscriptionState::Retired {
                return Err(PfeError::SubscriptionClosed);
            }
        }

        let id = transport.subscribe(self.kind, self.sink.clone()).await?;

        let retired = {
            let mut inner = self.inner.lock().expect("subscription lock poisoned");
            if inner.state == SubscriptionState::Retired {
                true
            } else {
                inner.state = SubscriptionState::Active;
                inner.id = Some(id);
                false
            }
        };

        if retired {
            // Retire won the race: undo the registration that landed late.
            let _ = transport.unsubscribe(id).await;
            return Err(PfeError::SubscriptionClosed);
        }
        Ok(())
    }

    /// Retires the subscription and cancels it at the transport.
    ///
    /// Safe to call at any point in the lifecycle, including while an
    /// `issue` is still in flight: the cancel is best effort and the
    /// subscription is Retired regardless.
    pub async fn retire(&self, transport: &dyn Transport) {
        let id = {
            let mut inner = self.inner.lock().expect("subscription lock poisoned");
            inner.state = SubscriptionState::Retired;
            inner.id.take()
        };

        if let Some(id) = id {
            if let Err(e) = transport.unsubscribe(id).await {
                debug!("unsubscribe {} failed (ignored): {}", id, e);
            }
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("subscription lock poisoned");
        f.debug_struct("EventSubscription")
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("id", &inner.id)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use pfe_client::{IfIndex, MockEngine};

    fn event() -> Event {
        Event::InterfaceState {
            if_index: IfIndex(1),
            up: true,
        }
    }

    #[tokio::test]
    async fn test_issue_then_notify() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::channel(4);
        let sub = EventSubscription::new(EventKind::InterfaceState, tx);
        assert_eq!(sub.state(), SubscriptionState::Issued);

        sub.issue(&engine).await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Active);
        assert!(sub.id().is_some());

        assert!(sub.notify(event()));
        assert_eq!(rx.try_recv().unwrap(), event());
    }

    #[tokio::test]
    async fn test_notify_overflow_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let sub = EventSubscription::new(EventKind::InterfaceState, tx);

        assert!(sub.notify(event()));
        assert!(!sub.notify(event()));
        assert_eq!(sub.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_retired_discards_events() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::channel(4);
        let sub = EventSubscription::new(EventKind::InterfaceState, tx);
        sub.issue(&engine).await.unwrap();
        sub.retire(&engine).await;

        assert!(!sub.notify(event()));
        assert!(rx.try_recv().is_err());
        assert_eq!(sub.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_retire_before_issue() {
        let engine = MockEngine::new();
        let (tx, _rx) = mpsc::channel(4);
        let sub = EventSubscription::new(EventKind::InterfaceState, tx);

        sub.retire(&engine).await;
        let err = sub.issue(&engine).await.unwrap_err();
        assert_eq!(err, PfeError::SubscriptionClosed);
        assert_eq!(sub.state(), SubscriptionState::Retired);
        assert_eq!(engine.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_retire_wins_race_with_slow_issue() {
        // The engine takes 50ms to acknowledge the subscribe; retire lands
        // in the middle. Once both complete the subscription must be
        // Retired and the transport must hold no registration.
        let engine = Arc::new(MockEngine::with_delay(Duration::from_millis(50)));
        let (tx, _rx) = mpsc::channel(4);
        let sub = Arc::new(EventSubscription::new(EventKind::MembershipReport, tx));

        let issue_engine = Arc::clone(&engine);
        let issue_sub = Arc::clone(&sub);
        let issue =
            tokio::spawn(async move { issue_sub.issue(issue_engine.as_ref()).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sub.retire(engine.as_ref()).await;

        let result = issue.await.unwrap();
        assert_eq!(result.unwrap_err(), PfeError::SubscriptionClosed);
        assert_eq!(sub.state(), SubscriptionState::Retired);
        assert_eq!(engine.active_subscriptions().await, 0);
    }
}
