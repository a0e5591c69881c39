//! The interface → group → source membership tree.
//!
//! Ordered maps at every level give logarithmic lookup and a
//! deterministic display order. Entries are never auto-created: lookups
//! return options, and only the listen/adopt paths insert.
//!
//! Interface administrative state and role live beside the configuration
//! subtrees: an `InterfaceConfig` exists only once something is
//! configured on the interface, while admin state can be registered for
//! interfaces with no configuration yet.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use pfe_client::IfIndex;

use crate::types::{
    check_family, AddressError, AdminStatus, GroupAddr, InterfaceMode, ListenFlags, ReportMode,
    SourceAddr,
};

/// Local state conflicts raised by tree mutations.
///
/// These are resolved against the current tree without contacting the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("this configuration already exists")]
    DuplicateConfig,

    #[error("this configuration does not exist")]
    NotFound,

    #[error("interface is down")]
    InterfaceDown,

    #[error("interface is in router mode")]
    RouterModeConflict,
}

/// Policy for a group whose last source was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupRetention {
    /// Keep the empty group. Default: an empty source list is
    /// meaningful in exclude mode (listen to everything).
    #[default]
    RetainEmpty,
    /// Delete the group, and the interface config once its last group
    /// goes.
    PruneEmpty,
}

/// Tree-level tunables.
#[derive(Debug, Clone, Default)]
pub struct MembershipConfig {
    /// What to do with a group that loses its last source.
    pub retention: GroupRetention,
}

/// One source address within a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub addr: SourceAddr,
    pub flags: ListenFlags,
}

/// One multicast group on an interface, owning its sources.
#[derive(Debug, Clone)]
pub struct Group {
    pub addr: GroupAddr,
    pub mode: ReportMode,
    sources: BTreeMap<SourceAddr, Source>,
}

impl Group {
    fn new(addr: GroupAddr, mode: ReportMode) -> Self {
        Self {
            addr,
            mode,
            sources: BTreeMap::new(),
        }
    }

    /// Returns the source entry, if configured.
    pub fn source(&self, addr: SourceAddr) -> Option<&Source> {
        self.sources.get(&addr)
    }

    /// Iterates sources in address order.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    /// Returns the number of sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

/// Per-interface membership configuration, owning its groups.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub if_index: IfIndex,
    groups: BTreeMap<GroupAddr, Group>,
}

impl InterfaceConfig {
    fn new(if_index: IfIndex) -> Self {
        Self {
            if_index,
            groups: BTreeMap::new(),
        }
    }

    /// Returns the group entry, if configured.
    pub fn group(&self, addr: GroupAddr) -> Option<&Group> {
        self.groups.get(&addr)
    }

    /// Iterates groups in address order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Returns the number of groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Registered admin state for an interface (owned by the platform, not
/// by the membership configuration).
#[derive(Debug, Clone, Copy)]
struct InterfaceState {
    admin: AdminStatus,
    mode: InterfaceMode,
}

/// Serializable view of one source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    pub addr: IpAddr,
    pub flags: ListenFlags,
}

/// Serializable view of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub addr: IpAddr,
    pub mode: ReportMode,
    pub sources: Vec<SourceSnapshot>,
}

/// Serializable view of one interface subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSnapshot {
    pub if_index: u32,
    pub groups: Vec<GroupSnapshot>,
}

/// Serializable view of the whole tree, ordered by interface index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TreeSnapshot {
    pub interfaces: Vec<InterfaceSnapshot>,
}

/// Nested interface/group/source membership state.
#[derive(Debug, Default)]
pub struct MembershipTree {
    config: MembershipConfig,
    states: BTreeMap<IfIndex, InterfaceState>,
    configs: BTreeMap<IfIndex, InterfaceConfig>,
}

impl MembershipTree {
    /// Creates an empty tree with the given policy.
    pub fn new(config: MembershipConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
            configs: BTreeMap::new(),
        }
    }

    /// Registers or updates an interface's admin state and role.
    pub fn register_interface(&mut self, if_index: IfIndex, admin: AdminStatus, mode: InterfaceMode) {
        self.states.insert(if_index, InterfaceState { admin, mode });
    }

    /// Updates the admin state of a registered interface.
    pub fn set_admin(&mut self, if_index: IfIndex, admin: AdminStatus) {
        if let Some(state) = self.states.get_mut(&if_index) {
            state.admin = admin;
        } else {
            self.states.insert(
                if_index,
                InterfaceState {
                    admin,
                    mode: InterfaceMode::Host,
                },
            );
        }
    }

    /// Returns the configuration subtree for an interface.
    pub fn lookup(&self, if_index: IfIndex) -> Option<&InterfaceConfig> {
        self.configs.get(&if_index)
    }

    /// Returns true if the exact (interface, group, source) row exists.
    pub fn contains(&self, if_index: IfIndex, group: GroupAddr, source: SourceAddr) -> bool {
        self.configs
            .get(&if_index)
            .and_then(|c| c.groups.get(&group))
            .map(|g| g.sources.contains_key(&source))
            .unwrap_or(false)
    }

    /// Enables listening for (interface, group, source).
    ///
    /// The interface must be registered, administratively up and in host
    /// role. An identical active row fails `DuplicateConfig` and leaves
    /// the tree untouched.
    pub fn listen_enable(
        &mut self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
        flags: ListenFlags,
    ) -> Result<(), MembershipError> {
        check_family(group, source)?;

        let state = self.states.get(&if_index);
        match state {
            None => return Err(MembershipError::InterfaceDown),
            Some(s) if !s.admin.is_up() => return Err(MembershipError::InterfaceDown),
            Some(s) if s.mode == InterfaceMode::Router => {
                return Err(MembershipError::RouterModeConflict)
            }
            Some(_) => {}
        }

        let config = self
            .configs
            .entry(if_index)
            .or_insert_with(|| InterfaceConfig::new(if_index));
        let group_entry = config
            .groups
            .entry(group)
            .or_insert_with(|| Group::new(group, ReportMode::default()));

        if group_entry.sources.contains_key(&source) {
            return Err(MembershipError::DuplicateConfig);
        }
        group_entry.sources.insert(
            source,
            Source {
                addr: source,
                flags,
            },
        );
        debug!("listen enable {} gaddr {} saddr {}", if_index, group, source);
        Ok(())
    }

    /// Disables listening for (interface, group, source).
    ///
    /// A row that was never configured fails `NotFound`. Whether an
    /// emptied group survives is governed by [`GroupRetention`].
    pub fn listen_disable(
        &mut self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
    ) -> Result<(), MembershipError> {
        let config = self
            .configs
            .get_mut(&if_index)
            .ok_or(MembershipError::NotFound)?;
        let group_entry = config
            .groups
            .get_mut(&group)
            .ok_or(MembershipError::NotFound)?;
        if group_entry.sources.remove(&source).is_none() {
            return Err(MembershipError::NotFound);
        }
        debug!("listen disable {} gaddr {} saddr {}", if_index, group, source);

        if self.config.retention == GroupRetention::PruneEmpty && group_entry.sources.is_empty() {
            config.groups.remove(&group);
            if config.groups.is_empty() {
                self.configs.remove(&if_index);
            }
        }
        Ok(())
    }

    /// Adopts a row without admin checks.
    ///
    /// Used when reconciling against engine state or learning from
    /// membership reports: the row exists remotely regardless of local
    /// admin state. Re-adopting an existing row is a no-op.
    pub fn adopt(
        &mut self,
        if_index: IfIndex,
        source: SourceAddr,
        group: GroupAddr,
        mode: ReportMode,
        flags: ListenFlags,
    ) {
        let config = self
            .configs
            .entry(if_index)
            .or_insert_with(|| InterfaceConfig::new(if_index));
        let group_entry = config
            .groups
            .entry(group)
            .or_insert_with(|| Group::new(group, mode));
        group_entry.sources.entry(source).or_insert(Source {
            addr: source,
            flags,
        });
    }

    /// Unconditionally removes the whole subtree for an interface.
    ///
    /// Forced cleanup: bypasses duplicate/not-found checks. Returns the
    /// (group, source) rows that were removed so the caller can retire
    /// their engine state.
    pub fn clear(&mut self, if_index: IfIndex) -> Vec<(GroupAddr, SourceAddr)> {
        let Some(config) = self.configs.remove(&if_index) else {
            return Vec::new();
        };
        let removed: Vec<_> = config
            .groups
            .values()
            .flat_map(|g| g.sources.keys().map(move |s| (g.addr, *s)))
            .collect();
        info!("clear {}: removed {} row(s)", if_index, removed.len());
        removed
    }

    /// Builds an ordered snapshot of one interface or the whole tree.
    pub fn snapshot(&self, if_index: Option<IfIndex>) -> TreeSnapshot {
        let configs: Vec<&InterfaceConfig> = match if_index {
            Some(idx) => self.configs.get(&idx).into_iter().collect(),
            None => self.configs.values().collect(),
        };

        TreeSnapshot {
            interfaces: configs
                .into_iter()
                .map(|c| InterfaceSnapshot {
                    if_index: c.if_index.0,
                    groups: c
                        .groups()
                        .map(|g| GroupSnapshot {
                            addr: g.addr.addr(),
                            mode: g.mode,
                            sources: g
                                .sources()
                                .map(|s| SourceSnapshot {
                                    addr: s.addr.addr(),
                                    flags: s.flags,
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Returns the number of interfaces with configuration.
    pub fn config_count(&self) -> usize {
        self.configs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(s: &str) -> GroupAddr {
        GroupAddr::new(s.parse().unwrap()).unwrap()
    }

    fn source(s: &str) -> SourceAddr {
        SourceAddr::new(s.parse().unwrap()).unwrap()
    }

    fn up_tree() -> MembershipTree {
        let mut tree = MembershipTree::new(MembershipConfig::default());
        tree.register_interface(IfIndex(1), AdminStatus::Up, InterfaceMode::Host);
        tree
    }

    #[test]
    fn test_enable_then_lookup() {
        let mut tree = up_tree();
        tree.listen_enable(
            IfIndex(1),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        )
        .unwrap();

        assert!(tree.contains(IfIndex(1), group("239.1.1.1"), source("10.0.0.1")));
        let config = tree.lookup(IfIndex(1)).unwrap();
        assert_eq!(config.group_count(), 1);
        assert_eq!(
            config.group(group("239.1.1.1")).unwrap().source_count(),
            1
        );
    }

    #[test]
    fn test_duplicate_enable_leaves_tree_unchanged() {
        let mut tree = up_tree();
        let enable = |t: &mut MembershipTree| {
            t.listen_enable(
                IfIndex(1),
                source("10.0.0.1"),
                group("239.1.1.1"),
                ListenFlags::CliConfigured,
            )
        };
        enable(&mut tree).unwrap();
        let before = tree.snapshot(None);

        assert_eq!(enable(&mut tree), Err(MembershipError::DuplicateConfig));
        assert_eq!(tree.snapshot(None), before);
    }

    #[test]
    fn test_interface_down_and_router_mode() {
        let mut tree = MembershipTree::new(MembershipConfig::default());
        let result = tree.listen_enable(
            IfIndex(9),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        );
        assert_eq!(result, Err(MembershipError::InterfaceDown));

        tree.register_interface(IfIndex(9), AdminStatus::Down, InterfaceMode::Host);
        let result = tree.listen_enable(
            IfIndex(9),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        );
        assert_eq!(result, Err(MembershipError::InterfaceDown));

        tree.register_interface(IfIndex(9), AdminStatus::Up, InterfaceMode::Router);
        let result = tree.listen_enable(
            IfIndex(9),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        );
        assert_eq!(result, Err(MembershipError::RouterModeConflict));
    }

    #[test]
    fn test_disable_unknown_row() {
        let mut tree = up_tree();
        let result = tree.listen_disable(IfIndex(1), source("10.0.0.1"), group("239.1.1.2"));
        assert_eq!(result, Err(MembershipError::NotFound));
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let mut tree = up_tree();
        let result = tree.listen_enable(
            IfIndex(1),
            source("2001:db8::1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        );
        assert!(matches!(result, Err(MembershipError::Address(_))));
    }

    #[test]
    fn test_retain_empty_group_by_default() {
        let mut tree = up_tree();
        tree.listen_enable(
            IfIndex(1),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        )
        .unwrap();
        tree.listen_disable(IfIndex(1), source("10.0.0.1"), group("239.1.1.1"))
            .unwrap();

        let config = tree.lookup(IfIndex(1)).unwrap();
        let g = config.group(group("239.1.1.1")).unwrap();
        assert_eq!(g.source_count(), 0);
    }

    #[test]
    fn test_prune_empty_group_policy() {
        let mut tree = MembershipTree::new(MembershipConfig {
            retention: GroupRetention::PruneEmpty,
        });
        tree.register_interface(IfIndex(1), AdminStatus::Up, InterfaceMode::Host);
        tree.listen_enable(
            IfIndex(1),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        )
        .unwrap();
        tree.listen_disable(IfIndex(1), source("10.0.0.1"), group("239.1.1.1"))
            .unwrap();

        // Group and the now-empty interface config are both gone.
        assert!(tree.lookup(IfIndex(1)).is_none());
        assert_eq!(tree.config_count(), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut tree = up_tree();
        for (g, s) in [
            ("239.1.1.1", "10.0.0.1"),
            ("239.1.1.1", "10.0.0.2"),
            ("239.1.1.2", "10.0.0.1"),
        ] {
            tree.listen_enable(
                IfIndex(1),
                source(s),
                group(g),
                ListenFlags::CliConfigured,
            )
            .unwrap();
        }

        let removed = tree.clear(IfIndex(1));
        assert_eq!(removed.len(), 3);
        assert!(tree.lookup(IfIndex(1)).is_none());
        assert!(tree.snapshot(Some(IfIndex(1))).interfaces.is_empty());

        // Clearing again is harmless.
        assert!(tree.clear(IfIndex(1)).is_empty());
    }

    #[test]
    fn test_snapshot_ordering() {
        let mut tree = up_tree();
        tree.register_interface(IfIndex(2), AdminStatus::Up, InterfaceMode::Host);
        // Insert out of order; snapshots come back ordered.
        tree.listen_enable(
            IfIndex(2),
            source("10.0.0.9"),
            group("239.9.9.9"),
            ListenFlags::CliConfigured,
        )
        .unwrap();
        tree.listen_enable(
            IfIndex(1),
            source("10.0.0.2"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        )
        .unwrap();
        tree.listen_enable(
            IfIndex(1),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ListenFlags::CliConfigured,
        )
        .unwrap();

        let snap = tree.snapshot(None);
        assert_eq!(snap.interfaces.len(), 2);
        assert_eq!(snap.interfaces[0].if_index, 1);
        assert_eq!(snap.interfaces[1].if_index, 2);
        let sources: Vec<_> = snap.interfaces[0].groups[0]
            .sources
            .iter()
            .map(|s| s.addr.to_string())
            .collect();
        assert_eq!(sources, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_adopt_bypasses_admin_checks() {
        let mut tree = MembershipTree::new(MembershipConfig::default());
        tree.adopt(
            IfIndex(7),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ReportMode::Include,
            ListenFlags::Learned,
        );
        assert!(tree.contains(IfIndex(7), group("239.1.1.1"), source("10.0.0.1")));

        // Adopting the same row again does not duplicate it.
        tree.adopt(
            IfIndex(7),
            source("10.0.0.1"),
            group("239.1.1.1"),
            ReportMode::Include,
            ListenFlags::Learned,
        );
        let g = tree.lookup(IfIndex(7)).unwrap().group(group("239.1.1.1")).unwrap();
        assert_eq!(g.source_count(), 1);
    }
}
