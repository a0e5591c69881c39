//! Object/command reconciliation core.
//!
//! This crate keeps desired configuration and the remote engine's actual
//! state consistent across an unreliable request/reply and event
//! transport:
//!
//! - [`StateCell`]: last-known-remote-state for one attribute, with an
//!   explicit settlement status
//! - [`MutationCommand`] / [`DumpCommand`]: operations issued against a
//!   [`Transport`](pfe_client::Transport), settling their cell
//! - [`Reconciler`]: at-most-one in-flight mutation per key, coalescing
//!   redundant requests, restart recovery via dump resync
//! - [`EventSubscription`]: persistent registration for engine events
//! - [`EventDispatcher`]: bounded-channel fan-out of events to listeners
//!
//! # Concurrency
//!
//! Two contexts touch this state: the issuing context (administrative
//! calls) and the transport receive context (replies and events). All
//! shared state sits behind one lock scoped to the whole object graph;
//! the receive path only ever enqueues.

pub mod command;
pub mod dispatch;
pub mod record;
pub mod state;
pub mod subscription;

pub use command::{CommandConfig, DumpCommand, MutationCommand, MutationOp};
pub use dispatch::{EventDispatcher, EventListener};
pub use record::{ObjectRecord, ReconcileError, Reconciler, RecordStatus, ResyncSummary};
pub use state::{CellError, CellStatus, StateCell};
pub use subscription::{EventSubscription, SubscriptionState};
