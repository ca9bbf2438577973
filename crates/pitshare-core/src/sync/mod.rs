//! Team-sharing synchronization layer
//!
//! ## Overview
//!
//! One participant (the host) streams live telemetry and session state to
//! teammates (guests) over peer-to-peer links, and every window of the
//! application sees the same data through a local relay bus and a backend
//! status bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RoleCoordinator (one per window)                               │
//! │  ├── Role: idle / host / guest, epoch-tagged sessions           │
//! │  ├── Broadcast cycle (200 ms) + keep-alive ticker (5 s)         │
//! │  ├── DataNormalizer (whitelist + wrapper peeling)               │
//! │  └── relay_targets(): provenance → sinks                        │
//! │                                                                 │
//! │  PeerTransport (one per session)                                │
//! │  ├── IrohTransport: QUIC links, room-derived endpoint keys      │
//! │  └── LoopbackTransport: in-process fabric                       │
//! │                                                                 │
//! │  LocalRelayBus: window ↔ window fan-out, no network             │
//! │  StatusBridge: process-wide (role, peerId) + data rebroadcast   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let bus = LocalRelayBus::default();
//! let coordinator = RoleCoordinator::builder(Arc::new(IrohTransportFactory::new()))
//!     .relay_bus(&bus)
//!     .build();
//!
//! let _status = coordinator.on_status_change(|status| println!("{status}"));
//! coordinator.start_hosting(Some("ird-team-4412-7"));
//!
//! // Feed the simulator stream; the broadcast cycle does the rest
//! coordinator.update_telemetry(record);
//! coordinator.update_session(session);
//! ```

pub mod bridge;
pub mod coordinator;
pub mod events;
pub mod iroh_transport;
pub mod listeners;
pub mod loopback;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use bridge::{BridgeEvent, BridgeEvents, BridgeHandle, ProcessStatusBridge, StatusBridge};
pub use coordinator::{CoordinatorBuilder, RoleCoordinator};
pub use events::{relay_targets, DataEvent, Origin, RelayTargets};
pub use iroh_transport::{
    resolve_endpoint_id, room_secret_key, IrohTransport, IrohTransportFactory, SYNC_ALPN,
};
pub use listeners::{Listeners, Subscription};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use protocol::{
    DriverInfo, FuelLap, MessageKind, SessionFrame, SyncMessage, TelemetryFrame,
};
pub use relay::{LocalRelayBus, RelayFrame, RelayPort, RelayReceiver, RelaySender};
pub use transport::{
    ConnectionTable, EventReceiver, EventSender, PeerTransport, TransportEvent, TransportFactory,
};
