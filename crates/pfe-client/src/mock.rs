//! In-memory mock engine for tests.
//!
//! `MockEngine` implements [`Transport`] against a local object table. It
//! records every request, can serve scripted failures for specific keys,
//! and can inject events into live subscriptions. An optional per-request
//! delay makes races (slow issue vs retire) reproducible.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{PfeResult, PfeStatus};
use crate::transport::{Event, EventKind, Reply, RemoteObject, Request, Transport};
use crate::types::{BindingPayload, ObjectKey, SubscriptionId};

#[derive(Default)]
struct MockState {
    /// Objects the engine currently holds.
    objects: BTreeMap<ObjectKey, BindingPayload>,
    /// Every request seen, in arrival order.
    log: Vec<Request>,
    /// Scripted replies per key, consumed front to back before the
    /// default behavior applies.
    scripted: HashMap<ObjectKey, VecDeque<PfeResult<Reply>>>,
    /// Live subscriptions.
    subscriptions: HashMap<SubscriptionId, (EventKind, mpsc::Sender<Event>)>,
}

/// Mock packet forwarding engine.
pub struct MockEngine {
    state: Mutex<MockState>,
    next_sub_id: AtomicU64,
    delay: Option<Duration>,
}

impl MockEngine {
    /// Creates a mock engine with no scripted behavior.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_sub_id: AtomicU64::new(1),
            delay: None,
        }
    }

    /// Creates a mock engine that sleeps before serving each request
    /// and subscription, for exercising in-flight races.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    /// Queues a scripted reply for the next bind/unbind on `key`.
    pub async fn script_reply(&self, key: ObjectKey, reply: PfeResult<Reply>) {
        let mut state = self.state.lock().await;
        state.scripted.entry(key).or_default().push_back(reply);
    }

    /// Seeds an object into the engine's table without a request, as if
    /// it had been configured before the control plane started.
    pub async fn seed_object(&self, key: ObjectKey, payload: BindingPayload) {
        let mut state = self.state.lock().await;
        state.objects.insert(key, payload);
    }

    /// Returns a copy of the request log.
    pub async fn requests(&self) -> Vec<Request> {
        self.state.lock().await.log.clone()
    }

    /// Returns the number of requests seen.
    pub async fn request_count(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Counts bind/unbind requests that targeted `key`.
    pub async fn mutation_count_for(&self, key: &ObjectKey) -> usize {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|r| match r {
                Request::Bind { key: k, .. } | Request::Unbind { key: k } => k == key,
                Request::Dump { .. } => false,
            })
            .count()
    }

    /// Returns true if the engine currently holds `key`.
    pub async fn holds(&self, key: &ObjectKey) -> bool {
        self.state.lock().await.objects.contains_key(key)
    }

    /// Returns the number of live subscriptions.
    pub async fn active_subscriptions(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Delivers an event to every matching subscription.
    ///
    /// Returns the number of subscriptions the event reached. Full
    /// channels drop the event, mirroring the enqueue-only receive path.
    pub async fn inject_event(&self, event: Event) -> usize {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for (kind, sink) in state.subscriptions.values() {
            if *kind == event.kind() && sink.try_send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_scripted(state: &mut MockState, key: &ObjectKey) -> Option<PfeResult<Reply>> {
        let queue = state.scripted.get_mut(key)?;
        let reply = queue.pop_front();
        if queue.is_empty() {
            state.scripted.remove(key);
        }
        reply
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockEngine {
    async fn send(&self, request: Request) -> PfeResult<Reply> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.log.push(request.clone());

        match request {
            Request::Bind { key, payload } => {
                if let Some(reply) = Self::take_scripted(&mut state, &key) {
                    debug!("mock: scripted reply for bind {}", key);
                    // Scripted acks still take effect on the table.
                    if matches!(reply, Ok(Reply::Ack)) {
                        state.objects.insert(key, payload);
                    }
                    return reply;
                }
                state.objects.insert(key, payload);
                Ok(Reply::Ack)
            }
            Request::Unbind { key } => {
                if let Some(reply) = Self::take_scripted(&mut state, &key) {
                    debug!("mock: scripted reply for unbind {}", key);
                    if matches!(reply, Ok(Reply::Ack)) {
                        state.objects.remove(&key);
                    }
                    return reply;
                }
                if state.objects.remove(&key).is_some() {
                    Ok(Reply::Ack)
                } else {
                    Ok(Reply::Nack(PfeStatus::NotFound))
                }
            }
            Request::Dump { kind } => {
                let objects = state
                    .objects
                    .iter()
                    .filter(|(k, _)| k.kind() == kind)
                    .map(|(k, p)| RemoteObject {
                        key: k.clone(),
                        payload: p.clone(),
                    })
                    .collect();
                Ok(Reply::Objects(objects))
            }
        }
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        sink: mpsc::Sender<Event>,
    ) -> PfeResult<SubscriptionId> {
        self.pause().await;
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().await;
        state.subscriptions.insert(id, (kind, sink));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> PfeResult<()> {
        // Tolerates unknown ids: cancel may race the subscribe itself.
        let mut state = self.state.lock().await;
        state.subscriptions.remove(&id);
        Ok(())
    }
}
