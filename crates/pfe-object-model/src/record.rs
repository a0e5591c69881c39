//! Object records and the reconciler.
//!
//! An [`ObjectRecord`] is the local representation of one desired
//! configuration object: its key, last-requested payload and the command
//! currently synchronizing it. The [`Reconciler`] enforces the core
//! invariant — at most one in-flight mutation per key — and coalesces
//! redundant requests so only the most recently requested target state is
//! ever issued, never an intermediate one.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pfe_client::{BindingPayload, ObjectKey, ObjectKind, PfeError, Transport};

use crate::command::{CommandConfig, DumpCommand, MutationCommand, MutationOp};
use crate::state::CellStatus;

/// Errors surfaced by reconciler operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// No record exists for the key (resolved locally, nothing issued).
    #[error("no record for {key}")]
    NotFound { key: ObjectKey },

    /// The transport or engine failed the operation.
    #[error(transparent)]
    Pfe(#[from] PfeError),
}

/// Externally visible synchronization state of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// A mutation for this record is outstanding.
    InProgress,
    /// The engine acknowledged the desired state.
    Applied,
    /// The last attempt failed; inspect and retry at will.
    Failed(PfeError),
}

/// The coalesced next target for a key with a mutation in flight.
#[derive(Debug, Clone)]
enum PendingTarget {
    Bind(BindingPayload),
    Unbind,
}

/// One desired configuration object and its current command.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    key: ObjectKey,
    desired: Option<BindingPayload>,
    current: MutationCommand,
    pending: Option<PendingTarget>,
}

impl ObjectRecord {
    fn new(key: ObjectKey, desired: Option<BindingPayload>, current: MutationCommand) -> Self {
        Self {
            key,
            desired,
            current,
            pending: None,
        }
    }

    /// Returns the object key.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Returns the last-requested payload, if the record is not marked
    /// for removal.
    pub fn desired(&self) -> Option<&BindingPayload> {
        self.desired.as_ref()
    }

    /// Returns the record's externally visible status.
    pub fn status(&self) -> RecordStatus {
        match self.current.status() {
            CellStatus::Unset | CellStatus::InProgress => RecordStatus::InProgress,
            CellStatus::Applied(_) => RecordStatus::Applied,
            CellStatus::Failed(e) => RecordStatus::Failed(e.clone()),
        }
    }

    fn in_flight(&self) -> bool {
        !self.current.is_settled()
    }
}

#[derive(Default)]
struct ReconcilerInner {
    records: BTreeMap<ObjectKey, ObjectRecord>,
}

/// Counters reported by a dump reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    /// Remote objects absent locally, adopted as Applied.
    pub adopted: usize,
    /// Local records confirmed by the dump.
    pub confirmed: usize,
    /// Local records missing remotely, re-issued.
    pub reapplied: usize,
}

/// Keeps desired object state synchronized with the engine.
///
/// Clone-cheap handle: clones share the record map and transport.
#[derive(Clone)]
pub struct Reconciler {
    transport: Arc<dyn Transport>,
    config: CommandConfig,
    inner: Arc<Mutex<ReconcilerInner>>,
}

impl Reconciler {
    /// Creates a reconciler over the given transport.
    pub fn new(transport: Arc<dyn Transport>, config: CommandConfig) -> Self {
        Self {
            transport,
            config,
            inner: Arc::new(Mutex::new(ReconcilerInner::default())),
        }
    }

    /// Requests that `key` be bound with `payload`.
    ///
    /// An equal payload already Applied is a no-op. A request while a
    /// mutation is in flight for the key is coalesced: the stored target
    /// is overwritten (last writer wins) and issued once the in-flight
    /// command settles; the coalesced caller returns immediately.
    pub async fn apply(
        &self,
        key: ObjectKey,
        payload: BindingPayload,
    ) -> Result<(), ReconcileError> {
        let cmd = {
            let mut inner = self.inner.lock().await;
            match inner.records.get_mut(&key) {
                Some(record) if record.in_flight() => {
                    debug!("apply {}: coalesced behind in-flight command", key);
                    record.pending = Some(PendingTarget::Bind(payload));
                    return Ok(());
                }
                Some(record) => {
                    let candidate = MutationCommand::bind(key.clone(), payload.clone());
                    if record.current == candidate && record.current.is_applied() {
                        debug!("apply {}: already applied, nothing to issue", key);
                        return Ok(());
                    }
                    record.desired = Some(payload);
                    record.current = candidate.clone();
                    candidate
                }
                None => {
                    let cmd = MutationCommand::bind(key.clone(), payload.clone());
                    inner.records.insert(
                        key.clone(),
                        ObjectRecord::new(key.clone(), Some(payload), cmd.clone()),
                    );
                    cmd
                }
            }
        };
        self.drive(key, cmd).await
    }

    /// Requests that `key` be unbound.
    ///
    /// The record is destroyed only on success; on failure it persists
    /// with `Failed` status for inspection and caller-driven retry.
    pub async fn remove(&self, key: ObjectKey) -> Result<(), ReconcileError> {
        let cmd = {
            let mut inner = self.inner.lock().await;
            match inner.records.get_mut(&key) {
                None => return Err(ReconcileError::NotFound { key }),
                Some(record) if record.in_flight() => {
                    debug!("remove {}: coalesced behind in-flight command", key);
                    record.pending = Some(PendingTarget::Unbind);
                    return Ok(());
                }
                Some(record) => {
                    let cmd = MutationCommand::unbind(key.clone());
                    record.desired = None;
                    record.current = cmd.clone();
                    cmd
                }
            }
        };
        self.drive(key, cmd).await
    }

    /// Drops a record without contacting the engine.
    ///
    /// Forced-cleanup path: the caller takes responsibility for any
    /// divergence until the next resync.
    pub async fn forget(&self, key: &ObjectKey) -> bool {
        self.inner.lock().await.records.remove(key).is_some()
    }

    /// Issues `cmd` and drains any targets coalesced while it flew.
    ///
    /// A superseded command's reply settles its own cell but is otherwise
    /// discarded; the record only ever reflects the newest target. A
    /// record removed while its command flew (forced cleanup) is not
    /// resurrected by the late reply.
    async fn drive(&self, key: ObjectKey, mut cmd: MutationCommand) -> Result<(), ReconcileError> {
        loop {
            let result = cmd.issue(self.transport.as_ref(), &self.config).await;

            let mut inner = self.inner.lock().await;
            let Some(record) = inner.records.get_mut(&key) else {
                debug!("{}: record gone, discarding outcome", cmd);
                return result.map_err(Into::into);
            };

            if let Some(next) = record.pending.take() {
                debug!("{}: superseded, issuing newest target", cmd);
                let next_cmd = match next {
                    PendingTarget::Bind(payload) => {
                        record.desired = Some(payload.clone());
                        MutationCommand::bind(key.clone(), payload)
                    }
                    PendingTarget::Unbind => {
                        record.desired = None;
                        MutationCommand::unbind(key.clone())
                    }
                };
                record.current = next_cmd.clone();
                drop(inner);
                cmd = next_cmd;
                continue;
            }

            record.current = cmd.clone();
            if result.is_ok() && cmd.op() == MutationOp::Unbind {
                inner.records.remove(&key);
            }
            return result.map_err(Into::into);
        }
    }

    /// Reconciles local records against a dump of the engine's state.
    ///
    /// Objects present remotely but unknown locally are adopted with
    /// Applied status and no request on the wire; records desired locally
    /// but missing from the dump get a fresh bind.
    pub async fn resync(&self, kind: ObjectKind) -> Result<ResyncSummary, ReconcileError> {
        let objects = DumpCommand::new(kind)
            .issue(self.transport.as_ref(), &self.config)
            .await?;

        let mut summary = ResyncSummary::default();
        let mut to_reapply = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut remote = BTreeMap::new();
            for obj in objects {
                remote.insert(obj.key.clone(), obj.payload);
            }

            for (key, payload) in &remote {
                match inner.records.get(key) {
                    None => {
                        let mut cmd = MutationCommand::bind(key.clone(), payload.clone());
                        cmd.adopt();
                        inner.records.insert(
                            key.clone(),
                            ObjectRecord::new(key.clone(), Some(payload.clone()), cmd),
                        );
                        summary.adopted += 1;
                    }
                    Some(record) if record.desired() == Some(payload) => {
                        summary.confirmed += 1;
                    }
                    Some(_) => {
                        // Desired and remote disagree; the desired side wins.
                    }
                }
            }

            for (key, record) in &inner.records {
                if key.kind() != kind || record.in_flight() {
                    continue;
                }
                if let Some(desired) = record.desired() {
                    if !remote.contains_key(key) {
                        to_reapply.push((key.clone(), desired.clone()));
                    }
                }
            }
        }

        for (key, payload) in to_reapply {
            info!("resync: re-issuing bind for {}", key);
            self.force_apply(key, payload).await?;
            summary.reapplied += 1;
        }

        info!(
            "resync {}: adopted {}, confirmed {}, reapplied {}",
            kind, summary.adopted, summary.confirmed, summary.reapplied
        );
        Ok(summary)
    }

    /// Issues a bind unconditionally, bypassing the applied-equality
    /// no-op check. Used when the engine is known to have lost the row.
    async fn force_apply(
        &self,
        key: ObjectKey,
        payload: BindingPayload,
    ) -> Result<(), ReconcileError> {
        let cmd = {
            let mut inner = self.inner.lock().await;
            match inner.records.get_mut(&key) {
                Some(record) if record.in_flight() => {
                    record.pending = Some(PendingTarget::Bind(payload));
                    return Ok(());
                }
                Some(record) => {
                    let cmd = MutationCommand::bind(key.clone(), payload.clone());
                    record.desired = Some(payload);
                    record.current = cmd.clone();
                    cmd
                }
                None => {
                    let cmd = MutationCommand::bind(key.clone(), payload.clone());
                    inner.records.insert(
                        key.clone(),
                        ObjectRecord::new(key.clone(), Some(payload), cmd.clone()),
                    );
                    cmd
                }
            }
        };
        self.drive(key, cmd).await
    }

    /// Returns the status of a record, if one exists.
    pub async fn status(&self, key: &ObjectKey) -> Option<RecordStatus> {
        self.inner
            .lock()
            .await
            .records
            .get(key)
            .map(|r| r.status())
    }

    /// Returns true if a record exists for the key.
    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.inner.lock().await.records.contains_key(key)
    }

    /// Returns the number of live records.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    /// Returns true if no records exist.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.records.is_empty()
    }

    /// Returns the keys of all live records, ordered.
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.inner.lock().await.records.keys().cloned().collect()
    }

    /// Returns every live record of a kind with its desired payload,
    /// ordered by key. Records marked for removal are skipped.
    pub async fn desired_entries(&self, kind: ObjectKind) -> Vec<(ObjectKey, BindingPayload)> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .filter(|(key, _)| key.kind() == kind)
            .filter_map(|(key, record)| {
                record.desired().map(|payload| (key.clone(), payload.clone()))
            })
            .collect()
    }

    /// Renders every record for diagnostics.
    pub async fn dump_records(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .records
            .values()
            .map(|r| format!("{} -> {:?}", r.current, r.status()))
            .collect()
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pfe_client::{IfIndex, MockEngine, PfeStatus, Reply};

    fn key() -> ObjectKey {
        ObjectKey::client(IfIndex(1), "host-a")
    }

    fn payload(v: &str) -> BindingPayload {
        BindingPayload::new().with_field("hostname", v)
    }

    fn fast_config() -> CommandConfig {
        CommandConfig {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
        }
    }

    fn reconciler(engine: &Arc<MockEngine>) -> Reconciler {
        Reconciler::new(
            Arc::clone(engine) as Arc<dyn Transport>,
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_apply_then_duplicate_is_noop() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);

        rec.apply(key(), payload("a")).await.unwrap();
        assert_eq!(rec.status(&key()).await, Some(RecordStatus::Applied));
        assert_eq!(engine.request_count().await, 1);

        // Identical payload against an Applied cell: nothing issued.
        rec.apply(key(), payload("a")).await.unwrap();
        assert_eq!(engine.request_count().await, 1);
    }

    #[tokio::test]
    async fn test_apply_new_payload_reissues() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);

        rec.apply(key(), payload("a")).await.unwrap();
        rec.apply(key(), payload("b")).await.unwrap();
        assert_eq!(engine.request_count().await, 2);
        assert_eq!(rec.status(&key()).await, Some(RecordStatus::Applied));
    }

    #[tokio::test]
    async fn test_remove_destroys_record_on_success() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);

        rec.apply(key(), payload("a")).await.unwrap();
        rec.remove(key()).await.unwrap();
        assert!(!rec.contains(&key()).await);
        assert!(!engine.holds(&key()).await);
        assert_eq!(engine.mutation_count_for(&key()).await, 2);
    }

    #[tokio::test]
    async fn test_remove_failure_keeps_record() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);
        rec.apply(key(), payload("a")).await.unwrap();

        engine
            .script_reply(key(), Ok(Reply::Nack(PfeStatus::InUse)))
            .await;
        let err = rec.remove(key()).await.unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Pfe(PfeError::Rejection {
                status: PfeStatus::InUse
            })
        );
        assert_eq!(
            rec.status(&key()).await,
            Some(RecordStatus::Failed(PfeError::Rejection {
                status: PfeStatus::InUse
            }))
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_key() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);
        let err = rec.remove(key()).await.unwrap_err();
        assert_eq!(err, ReconcileError::NotFound { key: key() });
        assert_eq!(engine.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_coalescing_issues_only_newest_target() {
        // The first bind is slow; two more applies land while it flies.
        // Only the newest (p3) may reach the wire after the first settles.
        let engine = Arc::new(MockEngine::with_delay(Duration::from_millis(40)));
        let rec = reconciler(&engine);

        let first = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.apply(key(), payload("p1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        rec.apply(key(), payload("p2")).await.unwrap();
        rec.apply(key(), payload("p3")).await.unwrap();
        first.await.unwrap().unwrap();

        // Wait for the drain to finish issuing the superseding bind.
        tokio::time::sleep(Duration::from_millis(80)).await;

        let requests = engine.requests().await;
        assert_eq!(requests.len(), 2, "intermediate p2 must never be issued");
        assert_eq!(engine.mutation_count_for(&key()).await, 2);
        assert_eq!(rec.status(&key()).await, Some(RecordStatus::Applied));
        assert!(engine.holds(&key()).await);
    }

    #[tokio::test]
    async fn test_remove_coalesced_behind_in_flight_bind() {
        let engine = Arc::new(MockEngine::with_delay(Duration::from_millis(40)));
        let rec = reconciler(&engine);

        let first = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.apply(key(), payload("p1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        rec.remove(key()).await.unwrap();
        first.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!rec.contains(&key()).await);
        assert!(!engine.holds(&key()).await);
    }

    #[tokio::test]
    async fn test_resync_adopts_without_issuing() {
        let engine = Arc::new(MockEngine::new());
        engine.seed_object(key(), payload("a")).await;
        let rec = reconciler(&engine);

        let summary = rec.resync(ObjectKind::ClientBinding).await.unwrap();
        assert_eq!(summary.adopted, 1);
        assert_eq!(summary.reapplied, 0);
        assert_eq!(rec.status(&key()).await, Some(RecordStatus::Applied));
        // Only the dump itself reached the wire.
        assert_eq!(engine.mutation_count_for(&key()).await, 0);

        // And a later identical apply stays a no-op.
        rec.apply(key(), payload("a")).await.unwrap();
        assert_eq!(engine.mutation_count_for(&key()).await, 0);
    }

    #[tokio::test]
    async fn test_resync_reapplies_missing_objects() {
        let engine = Arc::new(MockEngine::new());
        let rec = reconciler(&engine);
        rec.apply(key(), payload("a")).await.unwrap();

        // Engine loses the row behind our back.
        engine
            .send(pfe_client::Request::Unbind { key: key() })
            .await
            .unwrap();
        assert!(!engine.holds(&key()).await);

        let summary = rec.resync(ObjectKind::ClientBinding).await.unwrap();
        assert_eq!(summary.reapplied, 1);
        assert!(engine.holds(&key()).await);
    }
}
