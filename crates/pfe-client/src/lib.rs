//! Typed client surface for the packet forwarding engine (PFE).
//!
//! This crate defines everything the control plane needs to talk to the
//! remote engine without knowing its wire format:
//!
//! - [`error`]: engine status codes and the client error taxonomy
//! - [`types`]: object keys, payloads and identifiers
//! - [`transport`]: the request/reply/event model and the [`Transport`] trait
//! - [`mock`]: an in-memory engine for tests
//!
//! Wire encoding and framing are deliberately out of scope; a transport
//! implementation owns serialization and reply correlation and surfaces
//! exactly one reply (or one timeout) per request.

pub mod error;
pub mod mock;
pub mod transport;
pub mod types;

pub use error::{PfeError, PfeResult, PfeStatus};
pub use mock::MockEngine;
pub use transport::{Event, EventKind, Reply, RemoteObject, Request, Transport};
pub use types::{BindingPayload, IfIndex, ObjectKey, ObjectKind, SubscriptionId};
