//! Local relay bus between windows of one application instance
//!
//! ```text
//!  window_1 ──publish──┐
//!                      ▼
//!              broadcast::channel ──▶ window_2
//!                      │
//!                      └────────────▶ window_3
//! ```
//!
//! Every window attaches a [`RelayPort`] with its own [`WindowId`]. Frames are
//! stamped with the sender's id and a port silently drops frames it sent
//! itself, so a window never sees its own messages. No network is involved.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{ShareConfig, DEFAULT_EVENT_CHANNEL_CAPACITY};
use crate::sync::protocol::SyncMessage;
use crate::types::WindowId;

/// One message on the bus, stamped with the publishing window
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub sender: WindowId,
    pub message: SyncMessage,
}

/// Fan-out channel scoped to the current application instance
#[derive(Debug, Clone)]
pub struct LocalRelayBus {
    tx: broadcast::Sender<RelayFrame>,
}

impl Default for LocalRelayBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

impl LocalRelayBus {
    /// Create a bus buffering up to `capacity` frames per slow window
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Create a bus sized by `event_channel_capacity`
    pub fn from_config(config: &ShareConfig) -> Self {
        Self::new(config.event_channel_capacity)
    }

    /// Attach a new window
    pub fn attach(&self) -> RelayPort {
        let window = WindowId::next();
        debug!(%window, "Window attached to local relay bus");
        RelayPort {
            sender: RelaySender {
                window,
                tx: self.tx.clone(),
            },
            receiver: RelayReceiver {
                window,
                rx: self.tx.subscribe(),
            },
        }
    }

    /// Number of attached windows still listening
    pub fn window_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A window's attachment to the bus
#[derive(Debug)]
pub struct RelayPort {
    sender: RelaySender,
    receiver: RelayReceiver,
}

impl RelayPort {
    pub fn window_id(&self) -> WindowId {
        self.sender.window
    }

    /// Publish to every other window
    pub fn publish(&self, message: SyncMessage) -> usize {
        self.sender.publish(message)
    }

    /// Next message from another window; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.receiver.recv().await
    }

    /// Split into a cloneable publishing half and the receiving half
    pub fn split(self) -> (RelaySender, RelayReceiver) {
        (self.sender, self.receiver)
    }
}

/// Publishing half of a [`RelayPort`]
#[derive(Debug, Clone)]
pub struct RelaySender {
    window: WindowId,
    tx: broadcast::Sender<RelayFrame>,
}

impl RelaySender {
    pub fn window_id(&self) -> WindowId {
        self.window
    }

    /// Publish to every other window, returning how many are listening
    pub fn publish(&self, message: SyncMessage) -> usize {
        let kind = message.kind();
        let frame = RelayFrame {
            sender: self.window,
            message,
        };
        match self.tx.send(frame) {
            // Our own receiver counts as a subscriber
            Ok(receivers) => {
                let others = receivers.saturating_sub(1);
                debug!(window = %self.window, %kind, others, "Published on local relay bus");
                others
            }
            Err(_) => 0,
        }
    }
}

/// Receiving half of a [`RelayPort`]
#[derive(Debug)]
pub struct RelayReceiver {
    window: WindowId,
    rx: broadcast::Receiver<RelayFrame>,
}

impl RelayReceiver {
    pub fn window_id(&self) -> WindowId {
        self.window
    }

    /// Next message from another window; `None` once the bus is gone
    ///
    /// A window that falls behind loses the oldest frames and keeps going.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.sender == self.window => continue,
                Ok(frame) => return Some(frame.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(window = %self.window, skipped, "Local relay bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::SyncMessage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_window_never_receives_own_messages() {
        let bus = LocalRelayBus::new(16);
        let mut a = bus.attach();
        let mut b = bus.attach();

        assert_eq!(a.publish(SyncMessage::KeepAlive(1)), 1);

        assert_eq!(b.recv().await, Some(SyncMessage::KeepAlive(1)));
        let own = tokio::time::timeout(Duration::from_millis(50), a.recv()).await;
        assert!(own.is_err(), "window received its own message");
    }

    #[tokio::test]
    async fn test_fan_out_to_all_other_windows() {
        let bus = LocalRelayBus::default();
        let a = bus.attach();
        let mut b = bus.attach();
        let mut c = bus.attach();
        assert_eq!(bus.window_count(), 3);

        a.publish(SyncMessage::RequestSync);
        assert_eq!(b.recv().await, Some(SyncMessage::RequestSync));
        assert_eq!(c.recv().await, Some(SyncMessage::RequestSync));
    }

    #[tokio::test]
    async fn test_lagging_window_keeps_receiving() {
        let bus = LocalRelayBus::new(2);
        let a = bus.attach();
        let mut b = bus.attach();

        for ts in 0..5 {
            a.publish(SyncMessage::KeepAlive(ts));
        }
        // Oldest frames are gone, newest survive
        assert_eq!(b.recv().await, Some(SyncMessage::KeepAlive(3)));
        assert_eq!(b.recv().await, Some(SyncMessage::KeepAlive(4)));
    }

    #[tokio::test]
    async fn test_capacity_follows_config() {
        let config = ShareConfig {
            event_channel_capacity: 3,
            ..ShareConfig::default()
        };
        let bus = LocalRelayBus::from_config(&config);
        let a = bus.attach();
        let mut b = bus.attach();

        for ts in 0..6 {
            a.publish(SyncMessage::KeepAlive(ts));
        }
        assert_eq!(b.recv().await, Some(SyncMessage::KeepAlive(3)));
    }

    #[test]
    fn test_split_halves_share_window() {
        let bus = LocalRelayBus::default();
        let port = bus.attach();
        let window = port.window_id();
        let (tx, rx) = port.split();
        assert_eq!(tx.window_id(), window);
        assert_eq!(rx.window_id(), window);
    }
}
