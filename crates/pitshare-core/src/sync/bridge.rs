//! Backend status bridge
//!
//! The bridge is the per-process collaborator that tells every window which
//! role is active and with which identity, and rebroadcasts received data to
//! all windows. It exposes three operations (get status, push status, push
//! data) and a subscription that mirrors the two pushes.
//!
//! ```text
//!            ┌──────────────────────────┐
//!  window_1 ─┤                          ├─▶ window_2  StatusChanged / Data
//!  (origin)  │   ProcessStatusBridge    │
//!            │   current (role, peerId) ├─▶ window_3
//!            └──────────────────────────┘
//! ```
//!
//! Pushes are never delivered back to the window that made them.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ShareError, ShareResult};
use crate::sync::protocol::SyncMessage;
use crate::types::{StatusSnapshot, WindowId};

/// Notification from the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Another window announced a new role/identity
    StatusChanged(StatusSnapshot),
    /// Another window rebroadcast a received message
    Data(SyncMessage),
}

/// Receiving end of a bridge subscription
pub type BridgeEvents = mpsc::UnboundedReceiver<BridgeEvent>;

/// The bridge as seen from one window
pub trait StatusBridge: Send + Sync + 'static {
    /// Current process-wide status
    fn get_status(&self) -> ShareResult<StatusSnapshot>;

    /// Publish this window's status to the other windows
    fn update_status(&self, status: StatusSnapshot) -> ShareResult<()>;

    /// Rebroadcast a received message to the other windows
    fn broadcast_data(&self, message: SyncMessage) -> ShareResult<()>;

    /// Subscribe to pushes made by other windows
    fn subscribe(&self) -> ShareResult<BridgeEvents>;
}

struct Shared {
    status: Mutex<StatusSnapshot>,
    subscribers: Mutex<Vec<(WindowId, mpsc::UnboundedSender<BridgeEvent>)>>,
}

impl Shared {
    fn fan_out(&self, origin: WindowId, event: BridgeEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (window, tx) in subscribers.iter() {
            if *window == origin {
                continue;
            }
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// In-process bridge shared by every window of the application
#[derive(Clone)]
pub struct ProcessStatusBridge {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessStatusBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStatusBridge")
            .field("status", &*self.shared.status.lock())
            .field("subscribers", &self.shared.subscribers.lock().len())
            .finish()
    }
}

impl Default for ProcessStatusBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessStatusBridge {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(StatusSnapshot::idle()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a window, returning its view of the bridge
    pub fn attach(&self) -> BridgeHandle {
        let window = WindowId::next();
        debug!(%window, "Window attached to status bridge");
        BridgeHandle {
            window,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current process-wide status
    pub fn status(&self) -> StatusSnapshot {
        self.shared.status.lock().clone()
    }
}

/// One window's attachment to a [`ProcessStatusBridge`]
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    window: WindowId,
    shared: Weak<Shared>,
}

impl BridgeHandle {
    pub fn window_id(&self) -> WindowId {
        self.window
    }

    fn shared(&self) -> ShareResult<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| ShareError::Bridge("status bridge has shut down".to_string()))
    }
}

impl StatusBridge for BridgeHandle {
    fn get_status(&self) -> ShareResult<StatusSnapshot> {
        Ok(self.shared()?.status.lock().clone())
    }

    fn update_status(&self, status: StatusSnapshot) -> ShareResult<()> {
        let shared = self.shared()?;
        *shared.status.lock() = status.clone();
        let delivered = shared.fan_out(self.window, BridgeEvent::StatusChanged(status.clone()));
        debug!(window = %self.window, %status, delivered, "Status pushed to bridge");
        Ok(())
    }

    fn broadcast_data(&self, message: SyncMessage) -> ShareResult<()> {
        let shared = self.shared()?;
        let kind = message.kind();
        let delivered = shared.fan_out(self.window, BridgeEvent::Data(message));
        trace!(window = %self.window, %kind, delivered, "Data pushed to bridge");
        Ok(())
    }

    fn subscribe(&self) -> ShareResult<BridgeEvents> {
        let shared = self.shared()?;
        let (tx, rx) = mpsc::unbounded_channel();
        shared.subscribers.lock().push((self.window, tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, Role};

    #[test]
    fn test_status_fans_out_to_other_windows_only() {
        let bridge = ProcessStatusBridge::new();
        let a = bridge.attach();
        let b = bridge.attach();
        let mut a_events = a.subscribe().unwrap();
        let mut b_events = b.subscribe().unwrap();

        let status = StatusSnapshot::new(Role::Host, Some(PeerId::from("ird-team-1-2")));
        a.update_status(status.clone()).unwrap();

        assert_eq!(b_events.try_recv().unwrap(), BridgeEvent::StatusChanged(status.clone()));
        assert!(a_events.try_recv().is_err());
        assert_eq!(b.get_status().unwrap(), status);
        assert_eq!(bridge.status(), status);
    }

    #[test]
    fn test_data_fans_out() {
        let bridge = ProcessStatusBridge::new();
        let a = bridge.attach();
        let b = bridge.attach();
        let c = bridge.attach();
        let mut b_events = b.subscribe().unwrap();
        let mut c_events = c.subscribe().unwrap();

        a.broadcast_data(SyncMessage::KeepAlive(9)).unwrap();
        assert_eq!(b_events.try_recv().unwrap(), BridgeEvent::Data(SyncMessage::KeepAlive(9)));
        assert_eq!(c_events.try_recv().unwrap(), BridgeEvent::Data(SyncMessage::KeepAlive(9)));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bridge = ProcessStatusBridge::new();
        let a = bridge.attach();
        let b = bridge.attach();
        drop(b.subscribe().unwrap());

        a.broadcast_data(SyncMessage::RequestSync).unwrap();
        assert!(bridge.shared.subscribers.lock().is_empty());
    }

    #[test]
    fn test_handle_after_shutdown_errors() {
        let bridge = ProcessStatusBridge::new();
        let handle = bridge.attach();
        drop(bridge);

        assert!(matches!(handle.get_status(), Err(ShareError::Bridge(_))));
        assert!(handle.update_status(StatusSnapshot::idle()).is_err());
    }
}
