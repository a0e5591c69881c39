//! igmpmgrd - multicast membership manager daemon
//!
//! Keeps a per-interface group/source membership tree synchronized with a
//! remote packet-forwarding engine: administrative `listen`/`clear`
//! operations mutate the tree and issue engine bindings, and engine
//! events (membership reports, interface state) feed back into it.

mod igmp_mgr;
mod membership;
mod types;

pub use igmp_mgr::{AdminError, IgmpMgr};
pub use membership::{
    Group, GroupRetention, GroupSnapshot, InterfaceConfig, InterfaceSnapshot, MembershipConfig,
    MembershipError, MembershipTree, Source, SourceSnapshot, TreeSnapshot,
};
pub use types::{
    check_family, AddressError, AdminStatus, GroupAddr, InterfaceMode, ListenFlags, ReportMode,
    SourceAddr,
};
