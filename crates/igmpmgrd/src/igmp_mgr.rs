//! The membership manager's administrative surface.
//!
//! `IgmpMgr` ties the local [`MembershipTree`] to the remote engine: an
//! administrative mutation first resolves against the tree (which is
//! authoritative for the admin status code), then issues the matching
//! engine mutation through the [`Reconciler`]. Engine events arriving via
//! the [`EventDispatcher`] feed back into the tree.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use pfe_client::{
    BindingPayload, Event, EventKind, IfIndex, ObjectKey, ObjectKind, PfeError, PfeStatus,
    Transport,
};
use pfe_object_model::{
    CommandConfig, EventDispatcher, ReconcileError, Reconciler, RecordStatus, ResyncSummary,
};

use crate::membership::{
    MembershipConfig, MembershipError, MembershipTree, TreeSnapshot,
};
use crate::types::{
    AddressError, AdminStatus, GroupAddr, InterfaceMode, ListenFlags, ReportMode, SourceAddr,
};

/// Status codes returned by administrative operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error("invalid argument: {0}")]
    Validation(#[from] AddressError),

    #[error("this configuration already exists")]
    DuplicateConfig,

    #[error("this configuration does not exist")]
    NotFound,

    #[error("interface is down")]
    InterfaceDown,

    #[error("interface is in router mode")]
    RouterModeConflict,

    #[error("engine did not reply in time")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("engine rejected the operation: {0}")]
    Rejection(PfeStatus),
}

impl From<MembershipError> for AdminError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::Address(e) => AdminError::Validation(e),
            MembershipError::DuplicateConfig => AdminError::DuplicateConfig,
            MembershipError::NotFound => AdminError::NotFound,
            MembershipError::InterfaceDown => AdminError::InterfaceDown,
            MembershipError::RouterModeConflict => AdminError::RouterModeConflict,
        }
    }
}

impl From<PfeError> for AdminError {
    fn from(err: PfeError) -> Self {
        match err {
            PfeError::Rejection { status } => AdminError::Rejection(status),
            PfeError::Timeout => AdminError::Timeout,
            other => AdminError::Transport(other.to_string()),
        }
    }
}

impl From<ReconcileError> for AdminError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::NotFound { .. } => AdminError::NotFound,
            ReconcileError::Pfe(e) => e.into(),
        }
    }
}

/// Multicast membership manager.
///
/// Clone-cheap handle: clones share the tree, the reconciler's record
/// map and the dispatcher.
#[derive(Clone)]
pub struct IgmpMgr {
    transport: Arc<dyn Transport>,
    reconciler: Reconciler,
    tree: Arc<Mutex<MembershipTree>>,
    dispatcher: Arc<EventDispatcher>,
}

impl IgmpMgr {
    /// Dispatcher channel capacity. Events beyond this are dropped and
    /// counted rather than blocking the receive path.
    const EVENT_QUEUE_DEPTH: usize = 256;

    /// Creates a manager over the given transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        command_config: CommandConfig,
        membership_config: MembershipConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&transport), command_config),
            transport,
            tree: Arc::new(Mutex::new(MembershipTree::new(membership_config))),
            dispatcher: Arc::new(EventDispatcher::new(Self::EVENT_QUEUE_DEPTH)),
        }
    }

    fn tree(&self) -> std::sync::MutexGuard<'_, MembershipTree> {
        self.tree.lock().expect("membership tree poisoned")
    }

    /// Registers an interface's admin state and role.
    pub fn register_interface(&self, if_index: IfIndex, admin: AdminStatus, mode: InterfaceMode) {
        self.tree().register_interface(if_index, admin, mode);
    }

    /// Binds client configuration to an interface.
    #[instrument(skip(self))]
    pub async fn bind(&self, if_index: IfIndex, hostname: &str) -> Result<(), AdminError> {
        let key = ObjectKey::client(if_index, hostname);
        let payload = BindingPayload::new().with_field("hostname", hostname);
        self.reconciler.apply(key, payload).await?;
        Ok(())
    }

    /// Unbinds client configuration from an interface.
    #[instrument(skip(self))]
    pub async fn unbind(&self, if_index: IfIndex, hostname: &str) -> Result<(), AdminError> {
        let key = ObjectKey::client(if_index, hostname);
        self.reconciler.remove(key).await?;
        Ok(())
    }

    /// Enables listening for (interface, group, source).
    ///
    /// The tree mutation resolves first and is authoritative for the
    /// status code; on success the membership row is bound at the engine.
    /// An engine failure leaves the row configured with a Failed record
    /// for later retry or resync.
    #[instrument(skip(self))]
    pub async fn listen_enable(
        &self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
    ) -> Result<(), AdminError> {
        self.tree()
            .listen_enable(if_index, source, group, ListenFlags::CliConfigured)?;

        let key = ObjectKey::membership(if_index, group.addr(), source.addr());
        let payload = membership_payload(ReportMode::Include, ListenFlags::CliConfigured);
        self.reconciler.apply(key, payload).await?;
        Ok(())
    }

    /// Disables listening for (interface, group, source).
    ///
    /// A reconciler record that never existed (the enable's bind failed
    /// and was forgotten) is tolerated; the tree removal already
    /// succeeded.
    #[instrument(skip(self))]
    pub async fn listen_disable(
        &self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
    ) -> Result<(), AdminError> {
        self.tree().listen_disable(if_index, source, group)?;

        let key = ObjectKey::membership(if_index, group.addr(), source.addr());
        match self.reconciler.remove(key).await {
            Ok(()) | Err(ReconcileError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every membership row on an interface.
    ///
    /// Forced cleanup: never fails on an interface with nothing
    /// configured. Engine unbinds that fail are logged and the records
    /// dropped; the next resync restores consistency.
    #[instrument(skip(self))]
    pub async fn clear(&self, if_index: IfIndex) -> usize {
        let removed = self.tree().clear(if_index);
        let count = removed.len();

        for (group, source) in removed {
            let key = ObjectKey::membership(if_index, group.addr(), source.addr());
            match self.reconciler.remove(key.clone()).await {
                Ok(()) | Err(ReconcileError::NotFound { .. }) => {}
                Err(e) => {
                    warn!("clear: unbind {} failed ({}), dropping record", key, e);
                    self.reconciler.forget(&key).await;
                }
            }
        }
        count
    }

    /// Returns an ordered snapshot of one interface or the whole tree.
    pub fn show(&self, if_index: Option<IfIndex>) -> TreeSnapshot {
        self.tree().snapshot(if_index)
    }

    /// Returns the reconciler's view of one membership row.
    pub async fn row_status(
        &self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
    ) -> Option<RecordStatus> {
        let key = ObjectKey::membership(if_index, group.addr(), source.addr());
        self.reconciler.status(&key).await
    }

    /// Reconciles local state against a dump of the engine's membership
    /// rows, then mirrors adopted rows into the tree.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> Result<ResyncSummary, AdminError> {
        let summary = self.reconciler.resync(ObjectKind::Membership).await?;

        // Rows the reconciler adopted exist at the engine but may be
        // absent from the tree (restart recovery). Mirror them in as
        // learned rows, keeping the report mode the engine's payload
        // carries; admin checks do not apply to state that already
        // exists remotely.
        let entries = self.reconciler.desired_entries(ObjectKind::Membership).await;
        let mut tree = self.tree();
        for (key, payload) in entries {
            let ObjectKey::Membership {
                if_index,
                group,
                source,
            } = key
            else {
                continue;
            };
            let mode = payload
                .get_field("mode")
                .and_then(ReportMode::parse)
                .unwrap_or_default();
            match (GroupAddr::new(group), SourceAddr::new(source)) {
                (Ok(group), Ok(source)) => {
                    tree.adopt(if_index, source, group, mode, ListenFlags::Learned);
                }
                _ => warn!(
                    "resync: engine reported unusable membership row {} {} {}",
                    if_index, group, source
                ),
            }
        }
        Ok(summary)
    }

    /// Subscribes to the engine's event streams.
    pub async fn start(&self) -> Result<(), AdminError> {
        self.dispatcher
            .subscribe(self.transport.as_ref(), EventKind::MembershipReport)
            .await?;
        self.dispatcher
            .subscribe(self.transport.as_ref(), EventKind::InterfaceState)
            .await?;
        self.dispatcher
            .subscribe(self.transport.as_ref(), EventKind::BindingComplete)
            .await?;
        Ok(())
    }

    /// Retires every event subscription.
    pub async fn stop(&self) {
        self.dispatcher.retire_all(self.transport.as_ref()).await;
    }

    /// Returns the dispatcher for listener registration and draining.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Drains queued events without blocking.
    pub async fn poll_events(&self) -> usize {
        self.dispatcher.dispatch_pending().await
    }

    /// Waits for the next event and applies it.
    ///
    /// Returns `false` once the event channel is closed.
    pub async fn run_once(&self) -> bool {
        match self.dispatcher.dispatch_next().await {
            Some(event) => {
                self.handle_event(&event);
                true
            }
            None => false,
        }
    }

    /// Runs the event loop until the channel closes.
    pub async fn run(&self) {
        while self.run_once().await {}
    }

    /// Applies one engine event to local state.
    pub fn handle_event(&self, event: &Event) {
        match event {
            Event::MembershipReport {
                if_index,
                group,
                source,
                join,
            } => self.handle_report(*if_index, *group, *source, *join),
            Event::InterfaceState { if_index, up } => {
                let admin = if *up {
                    AdminStatus::Up
                } else {
                    AdminStatus::Down
                };
                info!("interface {} is now {:?}", if_index, admin);
                self.tree().set_admin(*if_index, admin);
            }
            Event::BindingComplete { key, status } => {
                if status.is_success() {
                    debug!("engine completed binding for {}", key);
                } else {
                    warn!("engine failed binding for {}: {}", key, status);
                }
            }
        }
    }

    fn handle_report(&self, if_index: IfIndex, group: IpAddr, source: IpAddr, join: bool) {
        let (group, source) = match (GroupAddr::new(group), SourceAddr::new(source)) {
            (Ok(g), Ok(s)) => (g, s),
            _ => {
                warn!(
                    "discarding report with unusable addresses on {}: gaddr {} saddr {}",
                    if_index, group, source
                );
                return;
            }
        };

        let mut tree = self.tree();
        if join {
            debug!("report: join {} gaddr {} saddr {}", if_index, group, source);
            tree.adopt(
                if_index,
                source,
                group,
                ReportMode::default(),
                ListenFlags::Learned,
            );
        } else {
            debug!("report: leave {} gaddr {} saddr {}", if_index, group, source);
            // The host may never have been configured locally.
            let _ = tree.listen_disable(if_index, source, group);
        }
    }
}

impl std::fmt::Debug for IgmpMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgmpMgr").finish_non_exhaustive()
    }
}

fn membership_payload(mode: ReportMode, flags: ListenFlags) -> BindingPayload {
    let origin = match flags {
        ListenFlags::CliConfigured => "config",
        ListenFlags::Learned => "learned",
    };
    BindingPayload::new()
        .with_field("mode", mode.as_str())
        .with_field("origin", origin)
}
