//! Provenance tagging and relay decisions
//!
//! Every message the coordinator handles carries an [`Origin`]. Where the
//! message is forwarded next is decided by [`relay_targets`], a pure function
//! of provenance, message kind, role and [`RelayPolicy`]. Keeping this in one
//! place is what prevents echo loops between the network, the local relay bus
//! and the status bridge.
//!
//! ```text
//! ┌────────────┬─────────────┬─────────┬───────────┬────────┐
//! │ origin     │ subscribers │ network │ local bus │ bridge │
//! ├────────────┼─────────────┼─────────┼───────────┼────────┤
//! │ Network    │ yes         │ no      │ data      │ data   │
//! │ LocalBus   │ yes         │ no      │ no        │ no     │
//! │ Bridge     │ yes         │ no      │ no        │ no     │
//! │ Own        │ no          │ yes     │ policy    │ no     │
//! │ Manual     │ no          │ yes     │ host      │ guest  │
//! └────────────┴─────────────┴─────────┴───────────┴────────┘
//! ```
//!
//! Network data is offered to both sibling fabrics, but the coordinator
//! hands it to only one of them: the bridge when one is attached, the local
//! bus otherwise. A remote peer's `status` never leaves the coordinator.

use std::fmt;

use tokio::time::Instant;

use crate::config::RelayPolicy;
use crate::sync::protocol::{MessageKind, SyncMessage};
use crate::types::{PeerId, Role};

/// Where a message entered this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Received from a remote peer over the transport
    Network,
    /// Received from a sibling window on the local relay bus
    LocalBus,
    /// Received from the backend status bridge
    Bridge,
    /// Produced by this coordinator's own timers or handshakes
    Own,
    /// Produced by an explicit caller request (`broadcast_manual`, `send_to_host`)
    Manual,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Network => write!(f, "network"),
            Origin::LocalBus => write!(f, "local-bus"),
            Origin::Bridge => write!(f, "bridge"),
            Origin::Own => write!(f, "self"),
            Origin::Manual => write!(f, "manual"),
        }
    }
}

/// The set of sinks a message is forwarded to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTargets {
    /// Local `on_data` subscribers
    pub subscribers: bool,
    /// Every open transport connection
    pub network: bool,
    /// Sibling windows via the local relay bus
    pub local_bus: bool,
    /// Sibling windows via the backend status bridge
    pub bridge: bool,
}

impl RelayTargets {
    /// Whether the message goes anywhere at all
    pub fn any(&self) -> bool {
        self.subscribers || self.network || self.local_bus || self.bridge
    }
}

/// Decide where a message goes next
pub fn relay_targets(origin: Origin, kind: MessageKind, role: Role, policy: &RelayPolicy) -> RelayTargets {
    match origin {
        Origin::Network => RelayTargets {
            subscribers: true,
            network: false,
            local_bus: kind != MessageKind::Status,
            bridge: kind != MessageKind::Status,
        },
        // Never back onto the network: that is what keeps windows from echoing
        Origin::LocalBus | Origin::Bridge => RelayTargets {
            subscribers: true,
            ..Default::default()
        },
        Origin::Own => RelayTargets {
            subscribers: false,
            network: role.is_active(),
            local_bus: role == Role::Host && policy_allows(kind, policy),
            bridge: false,
        },
        Origin::Manual => RelayTargets {
            subscribers: false,
            network: role.is_active(),
            local_bus: role == Role::Host,
            bridge: role == Role::Guest,
        },
    }
}

fn policy_allows(kind: MessageKind, policy: &RelayPolicy) -> bool {
    match kind {
        MessageKind::Telemetry => policy.telemetry_to_local_bus,
        MessageKind::Session => policy.session_to_local_bus,
        MessageKind::FuelHistory => policy.fuel_history_to_local_bus,
        // Link-level chatter stays on the link
        MessageKind::KeepAlive | MessageKind::RequestSync | MessageKind::Status => false,
        MessageKind::Unknown => true,
    }
}

/// A message delivered to `on_data` subscribers
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// Where the message came from
    pub origin: Origin,
    /// Remote connection that delivered it, for network messages
    pub from: Option<PeerId>,
    /// The message itself
    pub message: SyncMessage,
    /// When it was received
    pub received_at: Instant,
}

impl DataEvent {
    pub fn new(origin: Origin, from: Option<PeerId>, message: SyncMessage) -> Self {
        Self {
            origin,
            from,
            message,
            received_at: Instant::now(),
        }
    }
}
