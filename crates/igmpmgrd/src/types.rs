//! Address and interface types for membership configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Address validation errors, rejected before anything is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("{0} is not a multicast group address")]
    NotMulticast(IpAddr),

    #[error("{0} is not a valid unicast source address")]
    NotUnicast(IpAddr),

    // The source address is carried as `saddr`: a field named `source`
    // would be picked up by the thiserror derive as the error's cause,
    // and IpAddr is not an Error.
    #[error("group {group} and source {saddr} are different address families")]
    FamilyMismatch { group: IpAddr, saddr: IpAddr },
}

/// A validated multicast group address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupAddr(IpAddr);

impl GroupAddr {
    /// Validates and wraps a group address.
    pub fn new(addr: IpAddr) -> Result<Self, AddressError> {
        if addr.is_multicast() {
            Ok(Self(addr))
        } else {
            Err(AddressError::NotMulticast(addr))
        }
    }

    /// Returns the inner address.
    pub fn addr(&self) -> IpAddr {
        self.0
    }
}

impl fmt::Display for GroupAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated unicast source address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourceAddr(IpAddr);

impl SourceAddr {
    /// Validates and wraps a source address.
    pub fn new(addr: IpAddr) -> Result<Self, AddressError> {
        if addr.is_multicast() || addr.is_unspecified() {
            Err(AddressError::NotUnicast(addr))
        } else {
            Ok(Self(addr))
        }
    }

    /// Returns the inner address.
    pub fn addr(&self) -> IpAddr {
        self.0
    }
}

impl fmt::Display for SourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks that a group and source belong to the same address family.
pub fn check_family(group: GroupAddr, source: SourceAddr) -> Result<(), AddressError> {
    if group.addr().is_ipv4() == source.addr().is_ipv4() {
        Ok(())
    } else {
        Err(AddressError::FamilyMismatch {
            group: group.addr(),
            saddr: source.addr(),
        })
    }
}

/// Per-group report mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum ReportMode {
    /// Listen to the listed sources only.
    #[default]
    Include,
    /// Listen to everything except the listed sources.
    Exclude,
}

impl ReportMode {
    /// Returns the mode name used in payloads and display output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportMode::Include => "include",
            ReportMode::Exclude => "exclude",
        }
    }

    /// Parses the payload representation back into a mode.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "include" => Some(ReportMode::Include),
            "exclude" => Some(ReportMode::Exclude),
            _ => None,
        }
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminStatus {
    Up,
    Down,
}

impl AdminStatus {
    /// Returns true for `Up`.
    pub fn is_up(&self) -> bool {
        matches!(self, AdminStatus::Up)
    }
}

/// Role of an interface with respect to multicast signaling.
///
/// Listen configuration only makes sense in host role; an interface in
/// router role conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceMode {
    Host,
    Router,
}

/// Provenance of a configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenFlags {
    /// Configured through the administrative surface.
    CliConfigured,
    /// Learned from a membership report event.
    Learned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_addr_validation() {
        assert!(GroupAddr::new("239.1.1.1".parse().unwrap()).is_ok());
        assert!(GroupAddr::new("ff02::1".parse().unwrap()).is_ok());
        let err = GroupAddr::new("10.0.0.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, AddressError::NotMulticast(_)));
    }

    #[test]
    fn test_source_addr_validation() {
        assert!(SourceAddr::new("10.0.0.1".parse().unwrap()).is_ok());
        assert!(SourceAddr::new("239.1.1.1".parse().unwrap()).is_err());
        assert!(SourceAddr::new("0.0.0.0".parse().unwrap()).is_err());
    }

    #[test]
    fn test_family_check() {
        let group = GroupAddr::new("239.1.1.1".parse().unwrap()).unwrap();
        let v4 = SourceAddr::new("10.0.0.1".parse().unwrap()).unwrap();
        let v6 = SourceAddr::new("2001:db8::1".parse().unwrap()).unwrap();
        assert!(check_family(group, v4).is_ok());
        assert!(check_family(group, v6).is_err());
    }

    #[test]
    fn test_family_mismatch_renders_both_addresses() {
        use std::error::Error;

        let group = GroupAddr::new("239.1.1.1".parse().unwrap()).unwrap();
        let v6 = SourceAddr::new("2001:db8::1".parse().unwrap()).unwrap();
        let err = check_family(group, v6).unwrap_err();
        assert_eq!(
            err.to_string(),
            "group 239.1.1.1 and source 2001:db8::1 are different address families"
        );
        // An address is data, not a cause chain.
        assert!(err.source().is_none());
    }

    #[test]
    fn test_report_mode_default() {
        assert_eq!(ReportMode::default(), ReportMode::Include);
        assert_eq!(ReportMode::Exclude.as_str(), "exclude");
    }
}
