//! Request/reply/event model and the transport contract.
//!
//! A transport implementation owns serialization, reply correlation and
//! timeouts. The contract consumed by the object model is small: one
//! correlated reply (or one transport error) per `send`, and zero or more
//! asynchronous events per subscription until it is retired.

use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::mpsc;

use crate::error::{PfeResult, PfeStatus};
use crate::types::{BindingPayload, IfIndex, ObjectKey, ObjectKind, SubscriptionId};

/// A request sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Bind configuration to an object.
    Bind {
        key: ObjectKey,
        payload: BindingPayload,
    },
    /// Unbind configuration from an object.
    Unbind { key: ObjectKey },
    /// Enumerate every object of a kind the engine currently holds.
    Dump { kind: ObjectKind },
}

/// One object as enumerated by a dump reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: ObjectKey,
    pub payload: BindingPayload,
}

/// A correlated reply from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The operation succeeded.
    Ack,
    /// The engine refused the operation.
    Nack(PfeStatus),
    /// Dump enumeration result.
    Objects(Vec<RemoteObject>),
}

/// The families of asynchronous notification the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A membership report was received on an interface.
    MembershipReport,
    /// An interface changed administrative or link state.
    InterfaceState,
    /// A previously issued binding completed on the engine side.
    BindingComplete,
}

/// An unsolicited notification from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A host joined or left (interface, group, source, joined).
    MembershipReport {
        if_index: IfIndex,
        group: IpAddr,
        source: IpAddr,
        join: bool,
    },
    /// Interface went administratively up or down.
    InterfaceState { if_index: IfIndex, up: bool },
    /// The engine finished applying a binding for the given key.
    BindingComplete { key: ObjectKey, status: PfeStatus },
}

impl Event {
    /// Returns the kind this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MembershipReport { .. } => EventKind::MembershipReport,
            Event::InterfaceState { .. } => EventKind::InterfaceState,
            Event::BindingComplete { .. } => EventKind::BindingComplete,
        }
    }
}

/// Transport contract to the remote engine.
///
/// `send` suspends the caller until the correlated reply arrives or the
/// transport gives up (timeout, disconnect). `subscribe` registers a
/// channel that receives matching events until `unsubscribe`; the
/// transport's receive path must only enqueue into the channel and never
/// block on it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for its correlated reply.
    async fn send(&self, request: Request) -> PfeResult<Reply>;

    /// Registers an event subscription feeding the given channel.
    async fn subscribe(
        &self,
        kind: EventKind,
        sink: mpsc::Sender<Event>,
    ) -> PfeResult<SubscriptionId>;

    /// Cancels a subscription. Best effort: an id whose `subscribe` never
    /// completed must not be an error.
    async fn unsubscribe(&self, id: SubscriptionId) -> PfeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        let e = Event::InterfaceState {
            if_index: IfIndex(1),
            up: true,
        };
        assert_eq!(e.kind(), EventKind::InterfaceState);

        let e = Event::MembershipReport {
            if_index: IfIndex(1),
            group: "239.0.0.1".parse().unwrap(),
            source: "10.0.0.1".parse().unwrap(),
            join: true,
        };
        assert_eq!(e.kind(), EventKind::MembershipReport);
    }

    #[test]
    fn test_request_equality() {
        let a = Request::Bind {
            key: ObjectKey::client(IfIndex(1), "h"),
            payload: BindingPayload::new().with_field("hostname", "h"),
        };
        let b = Request::Bind {
            key: ObjectKey::client(IfIndex(1), "h"),
            payload: BindingPayload::new().with_field("hostname", "h"),
        };
        assert_eq!(a, b);
    }
}
