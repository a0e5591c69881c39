//! Commands issued against the engine transport.
//!
//! A command couples one operation with the [`StateCell`] that tracks its
//! outcome. Mutations (bind/unbind) settle their cell exactly once per
//! issue; dumps return the engine's enumeration for reconciliation.
//!
//! # Retry policy
//!
//! Transport faults are split by `PfeError::is_transport()`:
//! disconnects and malformed replies are retried with capped exponential
//! backoff up to `CommandConfig::max_attempts`; a timeout settles
//! `Failed(Timeout)` immediately and retrying is the caller's decision.
//! Protocol-level rejections are terminal and never retried.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use pfe_client::{
    BindingPayload, ObjectKey, ObjectKind, PfeError, PfeResult, RemoteObject, Reply, Request,
    Transport,
};

use crate::state::{CellStatus, StateCell};

/// Mutation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOp {
    /// Bind configuration to the object.
    Bind,
    /// Remove configuration from the object.
    Unbind,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOp::Bind => write!(f, "bind"),
            MutationOp::Unbind => write!(f, "unbind"),
        }
    }
}

/// Issue-time tunables shared by all commands.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Total attempts for retryable transport faults (including the first).
    pub max_attempts: u32,
    /// Base backoff between attempts.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff sleep.
    pub backoff_cap: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        }
    }
}

impl CommandConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.backoff_cap);
        // Jitter of up to half the interval spreads reissues apart.
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// A bind or unbind operation against one object.
///
/// Structural equality covers (key, op, payload) only; the cell is
/// deliberately excluded so a repeated request compares equal to the
/// command that already applied it.
#[derive(Debug, Clone)]
pub struct MutationCommand {
    key: ObjectKey,
    op: MutationOp,
    payload: BindingPayload,
    cell: StateCell<bool>,
}

impl PartialEq for MutationCommand {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.op == other.op && self.payload == other.payload
    }
}

impl Eq for MutationCommand {}

impl MutationCommand {
    /// Creates a bind command with a fresh cell.
    pub fn bind(key: ObjectKey, payload: BindingPayload) -> Self {
        Self {
            key,
            op: MutationOp::Bind,
            payload,
            cell: StateCell::new(),
        }
    }

    /// Creates an unbind command with a fresh cell.
    pub fn unbind(key: ObjectKey) -> Self {
        Self {
            key,
            op: MutationOp::Unbind,
            payload: BindingPayload::new(),
            cell: StateCell::new(),
        }
    }

    /// Returns the object key.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Returns the operation.
    pub fn op(&self) -> MutationOp {
        self.op
    }

    /// Returns the payload (empty for unbind).
    pub fn payload(&self) -> &BindingPayload {
        &self.payload
    }

    /// Returns the bound cell's status.
    pub fn status(&self) -> &CellStatus<bool> {
        self.cell.status()
    }

    /// Returns true once the cell has settled.
    pub fn is_settled(&self) -> bool {
        self.cell.is_settled()
    }

    /// Returns true if this command settled Applied.
    pub fn is_applied(&self) -> bool {
        self.cell.is_applied()
    }

    /// Settles the cell directly, bypassing the transport.
    ///
    /// Used by dump reconciliation to adopt objects the engine already
    /// holds without issuing a redundant bind.
    pub(crate) fn adopt(&mut self) {
        // A fresh cell: Unset -> InProgress -> Applied cannot fail.
        let _ = self.cell.begin_apply();
        let _ = self.cell.complete(Ok(true));
    }

    /// Issues the command and settles the cell from the reply.
    ///
    /// Returns `Ok(())` when the engine acknowledged; otherwise the error
    /// the cell settled with.
    pub async fn issue(
        &mut self,
        transport: &dyn Transport,
        config: &CommandConfig,
    ) -> PfeResult<()> {
        self.cell
            .begin_apply()
            .map_err(|e| PfeError::internal(e.to_string()))?;

        let mut attempt = 0u32;
        let outcome = loop {
            let request = match self.op {
                MutationOp::Bind => Request::Bind {
                    key: self.key.clone(),
                    payload: self.payload.clone(),
                },
                MutationOp::Unbind => Request::Unbind {
                    key: self.key.clone(),
                },
            };

            match transport.send(request).await {
                Ok(Reply::Ack) => break Ok(self.op == MutationOp::Bind),
                Ok(Reply::Nack(status)) => {
                    debug!("{} rejected: {}", self, status);
                    break Err(PfeError::Rejection { status });
                }
                Ok(Reply::Objects(_)) => {
                    // A dump reply correlated to a mutation is a broken
                    // transport, handled like any malformed reply.
                    let err = PfeError::malformed("enumeration reply to a mutation");
                    if let Some(e) = self.next_attempt(&mut attempt, err, config).await {
                        break Err(e);
                    }
                }
                Err(PfeError::Timeout) => break Err(PfeError::Timeout),
                Err(e) if e.is_transport() => {
                    if let Some(e) = self.next_attempt(&mut attempt, e, config).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let result = outcome.clone().map(|_| ());
        if let Err(conflict) = self.cell.complete(outcome) {
            warn!("{}: {}", self, conflict);
        }
        result
    }

    /// Backs off before the next attempt, or returns the terminal error
    /// once attempts are exhausted.
    async fn next_attempt(
        &self,
        attempt: &mut u32,
        err: PfeError,
        config: &CommandConfig,
    ) -> Option<PfeError> {
        *attempt += 1;
        if *attempt >= config.max_attempts {
            warn!("{} failed after {} attempts: {}", self, attempt, err);
            return Some(err);
        }
        let delay = config.backoff(*attempt);
        debug!("{}: transport fault ({}), retrying in {:?}", self, err, delay);
        tokio::time::sleep(delay).await;
        None
    }
}

impl fmt::Display for MutationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{} {} {}", self.op, self.key, self.cell.status())
        } else {
            write!(
                f,
                "{} {} [{}] {}",
                self.op,
                self.key,
                self.payload,
                self.cell.status()
            )
        }
    }
}

/// Bulk enumeration of one object kind.
///
/// Used at startup and for on-demand resync; the result feeds
/// [`Reconciler::resync`](crate::record::Reconciler::resync).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCommand {
    kind: ObjectKind,
}

impl DumpCommand {
    /// Creates a dump command for the given kind.
    pub fn new(kind: ObjectKind) -> Self {
        Self { kind }
    }

    /// Returns the enumerated kind.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Issues the enumeration request.
    ///
    /// Transport faults other than timeout are retried like mutations.
    pub async fn issue(
        &self,
        transport: &dyn Transport,
        config: &CommandConfig,
    ) -> PfeResult<Vec<RemoteObject>> {
        let mut attempt = 0u32;
        loop {
            match transport.send(Request::Dump { kind: self.kind }).await {
                Ok(Reply::Objects(objects)) => return Ok(objects),
                Ok(Reply::Ack) | Ok(Reply::Nack(_)) => {
                    return Err(PfeError::malformed("non-enumeration reply to a dump"))
                }
                Err(PfeError::Timeout) => return Err(PfeError::Timeout),
                Err(e) if e.is_transport() => {
                    attempt += 1;
                    if attempt >= config.max_attempts {
                        warn!("{} failed after {} attempts: {}", self, attempt, e);
                        return Err(e);
                    }
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl fmt::Display for DumpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dump {}", self.kind)
    }
}
