//! Event routing from the transport receive path to listeners.
//!
//! The dispatcher owns one bounded channel. The producer side is handed
//! to subscriptions (the receive context only ever enqueues); the
//! consumer side is drained by the issuing context, which invokes the
//! registered listeners. This decouples transport cadence from
//! object-model mutation cadence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use pfe_client::{Event, EventKind, PfeResult, Transport};

use crate::subscription::{EventSubscription, SubscriptionState};

/// Receiver of dispatched events.
///
/// Listeners run in the issuing context, after the event has crossed the
/// channel; they may mutate the object model.
pub trait EventListener: Send + Sync {
    /// Handles one event of a kind the listener registered for.
    fn on_event(&self, event: &Event);
}

/// Routes engine events to registered listeners.
pub struct EventDispatcher {
    tx: mpsc::Sender<Event>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    listeners: Mutex<HashMap<EventKind, Vec<Arc<dyn EventListener>>>>,
    subscriptions: Mutex<HashMap<EventKind, Arc<EventSubscription>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            listeners: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a listener for an event kind.
    pub fn register_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Subscribes to an event kind at the transport.
    ///
    /// At most one live subscription exists per kind: a second call for
    /// the same kind returns the existing handle.
    pub async fn subscribe(
        &self,
        transport: &dyn Transport,
        kind: EventKind,
    ) -> PfeResult<Arc<EventSubscription>> {
        let existing = {
            let subs = self.subscriptions.lock().expect("subscription map poisoned");
            subs.get(&kind)
                .filter(|s| s.state() != SubscriptionState::Retired)
                .cloned()
        };
        if let Some(sub) = existing {
            return Ok(sub);
        }

        let sub = Arc::new(EventSubscription::new(kind, self.tx.clone()));
        sub.issue(transport).await?;

        // A concurrent subscribe for the same kind may have registered
        // while ours was in flight; the first to insert wins and the
        // loser retires its registration.
        let winner = {
            let mut subs = self.subscriptions.lock().expect("subscription map poisoned");
            match subs.get(&kind) {
                Some(existing) if existing.state() != SubscriptionState::Retired => {
                    Some(Arc::clone(existing))
                }
                _ => {
                    subs.insert(kind, Arc::clone(&sub));
                    None
                }
            }
        };
        if let Some(winner) = winner {
            debug!("duplicate {:?} subscription lost the race, retiring", kind);
            sub.retire(transport).await;
            return Ok(winner);
        }
        Ok(sub)
    }

    /// Retires every live subscription.
    pub async fn retire_all(&self, transport: &dyn Transport) {
        let subs: Vec<_> = {
            let mut map = self.subscriptions.lock().expect("subscription map poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for sub in subs {
            sub.retire(transport).await;
        }
    }

    /// Returns a producer handle for injecting events (tests, local
    /// transports).
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Drains every queued event without blocking.
    ///
    /// Returns the number of events delivered to listeners.
    pub async fn dispatch_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            self.deliver(&event);
            count += 1;
        }
        count
    }

    /// Waits for the next event and delivers it.
    ///
    /// Returns `None` once every producer handle is gone.
    pub async fn dispatch_next(&self) -> Option<Event> {
        let event = {
            let mut rx = self.rx.lock().await;
            rx.recv().await?
        };
        self.deliver(&event);
        Some(event)
    }

    fn deliver(&self, event: &Event) {
        let listeners = {
            let map = self.listeners.lock().expect("listener registry poisoned");
            map.get(&event.kind()).cloned().unwrap_or_default()
        };
        if listeners.is_empty() {
            debug!("no listener for {:?} event", event.kind());
            return;
        }
        trace!("dispatching {:?} to {} listener(s)", event.kind(), listeners.len());
        for listener in listeners {
            listener.on_event(event);
        }
    }
}
