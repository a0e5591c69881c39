//! Core identifier and payload types shared across the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Software interface index assigned by the engine.
///
/// Index allocation itself is owned by the engine; the control plane only
/// carries the value around.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IfIndex(pub u32);

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw_if_index {}", self.0)
    }
}

/// The kinds of configuration object the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A per-interface client binding (interface + hostname).
    ClientBinding,
    /// A multicast membership row (interface + group + source).
    Membership,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::ClientBinding => write!(f, "client-binding"),
            ObjectKind::Membership => write!(f, "membership"),
        }
    }
}

/// Identity of one configuration object. Unique per live object.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ObjectKey {
    /// Client binding keyed by interface and hostname.
    Client { if_index: IfIndex, hostname: String },
    /// Membership row keyed by interface, group address and source address.
    Membership {
        if_index: IfIndex,
        group: IpAddr,
        source: IpAddr,
    },
}

impl ObjectKey {
    /// Creates a client binding key.
    pub fn client(if_index: IfIndex, hostname: impl Into<String>) -> Self {
        ObjectKey::Client {
            if_index,
            hostname: hostname.into(),
        }
    }

    /// Creates a membership key.
    pub fn membership(if_index: IfIndex, group: IpAddr, source: IpAddr) -> Self {
        ObjectKey::Membership {
            if_index,
            group,
            source,
        }
    }

    /// Returns the object kind this key belongs to.
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectKey::Client { .. } => ObjectKind::ClientBinding,
            ObjectKey::Membership { .. } => ObjectKind::Membership,
        }
    }

    /// Returns the interface the object lives on.
    pub fn if_index(&self) -> IfIndex {
        match self {
            ObjectKey::Client { if_index, .. } => *if_index,
            ObjectKey::Membership { if_index, .. } => *if_index,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Client { if_index, hostname } => {
                write!(f, "client-binding {} hostname {}", if_index, hostname)
            }
            ObjectKey::Membership {
                if_index,
                group,
                source,
            } => write!(
                f,
                "membership {} gaddr {} saddr {}",
                if_index, group, source
            ),
        }
    }
}

/// Attribute set carried by a bind request.
///
/// Field-value pairs keep the payload uniform across object kinds; the
/// field order is preserved so two payloads built the same way compare
/// equal and render identically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindingPayload {
    fields: Vec<(String, String)>,
}

impl BindingPayload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing any existing value for the same name.
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(field, value);
        self
    }

    /// Sets a field, replacing any existing value for the same name.
    pub fn set_field(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        if let Some(existing) = self.fields.iter_mut().find(|(f, _)| *f == field) {
            existing.1 = value;
        } else {
            self.fields.push((field, value));
        }
    }

    /// Returns the value for a field, if present.
    pub fn get_field(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the payload carries the given field.
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|(f, _)| f == field)
    }

    /// Returns true if the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over field-value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }
}

impl fmt::Display for BindingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, value) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", field, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Handle identifying one event subscription at the transport.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_kind() {
        let k = ObjectKey::client(IfIndex(1), "host-a");
        assert_eq!(k.kind(), ObjectKind::ClientBinding);
        assert_eq!(k.if_index(), IfIndex(1));

        let k = ObjectKey::membership(
            IfIndex(2),
            "239.1.1.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );
        assert_eq!(k.kind(), ObjectKind::Membership);
        assert_eq!(k.if_index(), IfIndex(2));
    }

    #[test]
    fn test_object_key_display() {
        let k = ObjectKey::membership(
            IfIndex(3),
            "239.1.1.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        );
        assert_eq!(
            k.to_string(),
            "membership sw_if_index 3 gaddr 239.1.1.1 saddr 10.0.0.1"
        );
    }

    #[test]
    fn test_payload_field_replacement() {
        let p = BindingPayload::new()
            .with_field("hostname", "host-a")
            .with_field("hostname", "host-b");
        assert_eq!(p.get_field("hostname"), Some("host-b"));
        assert_eq!(p.iter().count(), 1);
    }

    #[test]
    fn test_payload_equality_and_display() {
        let a = BindingPayload::new()
            .with_field("hostname", "h")
            .with_field("broadcast", "true");
        let b = BindingPayload::new()
            .with_field("hostname", "h")
            .with_field("broadcast", "true");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "hostname=h broadcast=true");
    }
}
