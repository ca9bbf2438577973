//! Pitshare Core Library
//!
//! Live race-telemetry sharing between teammates.
//!
//! ## Overview
//!
//! During an endurance race the driver in the car (the host) runs the
//! simulator; teammates in the pits (guests) want the same fuel numbers,
//! lap counts and session state on their own dashboards. Pitshare streams a
//! reduced, bandwidth-bounded copy of the host's telemetry over peer-to-peer
//! links and fans it out to every window of the application.
//!
//! ## Core Principles
//!
//! - **One authoritative role** per process: idle, host or guest
//! - **Best effort**: no guaranteed delivery, periodic resync instead
//! - **Loop free**: relay decisions depend only on where a message came from
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pitshare_core::{IrohTransportFactory, RoleCoordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = RoleCoordinator::new(Arc::new(IrohTransportFactory::new()));
//!
//!     // Teammate side
//!     coordinator.join_session("ird-team-4412-7");
//!     let _data = coordinator.on_data(|event| println!("{}", event.message.kind()));
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     coordinator.stop();
//! }
//! ```

pub mod auto_sync;
pub mod config;
pub mod error;
pub mod normalize;
pub mod sync;
pub mod types;

// Re-exports
pub use auto_sync::{room_id, AutoSyncAction, AutoTeamSync, LocalFacts};
pub use config::{RelayPolicy, ShareConfig};
pub use error::{ShareError, ShareResult};
pub use normalize::{DataNormalizer, TelemetryRecord};
pub use sync::{
    DataEvent, IrohTransportFactory, LocalRelayBus, LoopbackNetwork, Origin, PeerTransport,
    ProcessStatusBridge, RoleCoordinator, StatusBridge, Subscription, SyncMessage,
    TransportFactory,
};
pub use types::*;
