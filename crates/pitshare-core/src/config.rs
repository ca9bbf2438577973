//! Tunables for the sharing core
//!
//! Defaults match the cadence the dashboards were tuned for: telemetry at
//! 5 Hz, session every two seconds, keep-alive every five seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default period of the host broadcast cycle
pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 200;
/// Default minimum gap between session sends
pub const DEFAULT_SESSION_INTERVAL_MS: u64 = 2000;
/// Default keep-alive period
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 5000;
/// Default silence after which a guest asks the host for a resync
pub const DEFAULT_RESYNC_AFTER_MS: u64 = 10_000;
/// Default cap on the driver list inside a session payload
pub const DEFAULT_MAX_DRIVERS: usize = 100;
/// Default nesting depth for wrapper peeling
pub const DEFAULT_UNWRAP_DEPTH: usize = 5;
/// Default capacity for broadcast channels (local bus, bridge)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which message kinds produced by this window are mirrored onto the local
/// relay bus in addition to the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPolicy {
    /// Mirror host telemetry to sibling windows. Off by default because every
    /// window normally has its own simulator feed.
    pub telemetry_to_local_bus: bool,
    /// Mirror host session snapshots to sibling windows
    pub session_to_local_bus: bool,
    /// Mirror fuel history to sibling windows
    pub fuel_history_to_local_bus: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            telemetry_to_local_bus: false,
            session_to_local_bus: true,
            fuel_history_to_local_bus: true,
        }
    }
}

/// Configuration for a [`RoleCoordinator`](crate::sync::RoleCoordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Broadcast-cycle tick (telemetry cadence)
    pub telemetry_interval_ms: u64,
    /// Minimum gap between session sends
    pub session_interval_ms: u64,
    /// Keep-alive ticker period
    pub keep_alive_interval_ms: u64,
    /// Guest silence threshold before re-sending `request_sync`
    pub resync_after_ms: u64,
    /// Driver list cap for filtered sessions
    pub max_drivers: usize,
    /// Wrapper peeling depth cap
    pub unwrap_depth: usize,
    /// Capacity of broadcast channels
    pub event_channel_capacity: usize,
    /// Local relay decisions for self-originated messages
    pub relay: RelayPolicy,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            session_interval_ms: DEFAULT_SESSION_INTERVAL_MS,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            resync_after_ms: DEFAULT_RESYNC_AFTER_MS,
            max_drivers: DEFAULT_MAX_DRIVERS,
            unwrap_depth: DEFAULT_UNWRAP_DEPTH,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            relay: RelayPolicy::default(),
        }
    }
}

impl ShareConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms.max(1))
    }

    pub fn session_interval(&self) -> Duration {
        Duration::from_millis(self.session_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }

    pub fn resync_after(&self) -> Duration {
        Duration::from_millis(self.resync_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShareConfig::default();
        assert_eq!(config.telemetry_interval(), Duration::from_millis(200));
        assert_eq!(config.session_interval(), Duration::from_millis(2000));
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(5000));
        assert_eq!(config.max_drivers, 100);
        assert_eq!(config.unwrap_depth, 5);
        assert!(!config.relay.telemetry_to_local_bus);
        assert!(config.relay.session_to_local_bus);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ShareConfig =
            serde_json::from_str(r#"{"telemetry_interval_ms": 100, "relay": {"telemetry_to_local_bus": true}}"#)
                .unwrap();
        assert_eq!(config.telemetry_interval_ms, 100);
        assert_eq!(config.session_interval_ms, DEFAULT_SESSION_INTERVAL_MS);
        assert!(config.relay.telemetry_to_local_bus);
        assert!(config.relay.fuel_history_to_local_bus);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let config = ShareConfig {
            telemetry_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.telemetry_interval(), Duration::from_millis(1));
    }
}
