//! Core types for Pitshare

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Sharing role of this process
///
/// Exactly one role is authoritative per process at any time. It only changes
/// through start-hosting, join or stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Not sharing
    #[default]
    Idle,
    /// Producing telemetry and distributing it to guests
    Host,
    /// Consuming a host's telemetry
    Guest,
}

impl Role {
    /// Whether this role is actively sharing
    pub fn is_active(&self) -> bool {
        !matches!(self, Role::Idle)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Idle => write!(f, "idle"),
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// Opaque endpoint identity assigned by the transport
///
/// Either a caller-supplied room id or a transport-generated id. Connections
/// are keyed by the remote side's `PeerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs (first 8 chars)
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The externally observable sharing state: role plus endpoint identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current role
    #[serde(rename = "mode")]
    pub role: Role,
    /// Endpoint identity, once the transport has opened
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

impl StatusSnapshot {
    /// Create a status snapshot
    pub fn new(role: Role, peer_id: Option<PeerId>) -> Self {
        Self { role, peer_id }
    }

    /// The idle status with no identity
    pub fn idle() -> Self {
        Self::default()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{} ({})", self.role, id),
            None => write!(f, "{}", self.role),
        }
    }
}

/// Identifies one window (attachment) on the local relay bus or status bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(u64);

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

impl WindowId {
    /// Allocate a process-unique window id
    pub fn next() -> Self {
        Self(NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_default_is_idle() {
        assert_eq!(Role::default(), Role::Idle);
        assert!(!Role::Idle.is_active());
        assert!(Role::Host.is_active());
        assert!(Role::Guest.is_active());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"host\"");
        let role: Role = serde_json::from_str("\"guest\"").unwrap();
        assert_eq!(role, Role::Guest);
    }

    #[test]
    fn test_status_snapshot_wire_shape() {
        let status = StatusSnapshot::new(Role::Host, Some(PeerId::from("ird-team-9-3")));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "host", "peerId": "ird-team-9-3"}));

        let idle = serde_json::to_value(StatusSnapshot::idle()).unwrap();
        assert_eq!(idle, serde_json::json!({"mode": "idle"}));
    }

    #[test]
    fn test_peer_id_short() {
        assert_eq!(PeerId::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(PeerId::from("abc").short(), "abc");
    }

    #[test]
    fn test_window_ids_are_unique() {
        let a = WindowId::next();
        let b = WindowId::next();
        assert_ne!(a, b);
    }
}
