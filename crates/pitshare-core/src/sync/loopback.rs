//! In-process peer transport
//!
//! [`LoopbackNetwork`] is a registry of endpoints living in the same process.
//! Every endpoint has an inbox; connecting, accepting, sending and closing are
//! signals dropped into the remote inbox. It backs same-machine sessions (two
//! windows that want a real host/guest link without touching the network) and
//! deterministic tests.
//!
//! Unlike a QUIC endpoint, the registry can see every identity, so opening an
//! endpoint under an identity that is already live fails with
//! [`ShareError::IdentityTaken`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ShareError;
use crate::sync::protocol::SyncMessage;
use crate::sync::transport::{
    ConnectionTable, EventReceiver, EventSender, PeerTransport, TransportEvent, TransportFactory,
};
use crate::types::PeerId;

#[derive(Debug)]
enum Signal {
    Connect { from: PeerId },
    Accepted { from: PeerId },
    Frame { from: PeerId, message: SyncMessage },
    Close { from: PeerId },
}

type Inbox = mpsc::UnboundedSender<Signal>;

/// Registry of in-process endpoints
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, Inbox>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities currently registered
    pub fn identities(&self) -> Vec<PeerId> {
        let endpoints = self.endpoints.lock();
        let mut ids: Vec<PeerId> = endpoints
            .iter()
            .filter(|(_, inbox)| !inbox.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn register(&self, id: &PeerId, inbox: Inbox) -> Result<(), ShareError> {
        let mut endpoints = self.endpoints.lock();
        if let Some(existing) = endpoints.get(id) {
            if !existing.is_closed() {
                return Err(ShareError::IdentityTaken(id.to_string()));
            }
        }
        endpoints.insert(id.clone(), inbox);
        Ok(())
    }

    fn unregister(&self, id: &PeerId) {
        self.endpoints.lock().remove(id);
    }

    fn deliver(&self, to: &PeerId, signal: Signal) -> Result<(), ShareError> {
        let inbox = self
            .endpoints
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| ShareError::PeerUnavailable(to.to_string()))?;
        inbox
            .send(signal)
            .map_err(|_| ShareError::PeerUnavailable(to.to_string()))
    }
}

impl TransportFactory for LoopbackNetwork {
    fn open(&self, forced_id: Option<&str>) -> (Arc<dyn PeerTransport>, EventReceiver) {
        let (transport, events) = LoopbackTransport::open(self.clone(), forced_id);
        (Arc::new(transport), events)
    }
}

struct Inner {
    network: LoopbackNetwork,
    /// Set only when registration succeeded
    local_id: Mutex<Option<PeerId>>,
    table: Mutex<ConnectionTable<()>>,
    events: Mutex<Option<EventSender>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn me(&self) -> Option<PeerId> {
        self.local_id.lock().clone()
    }

    fn handle(&self, signal: Signal) {
        let Some(me) = self.me() else {
            return;
        };
        match signal {
            Signal::Connect { from } => {
                debug!(local = %me.short(), remote = %from.short(), "Accepting loopback connection");
                if let Err(error) = self.network.deliver(&from, Signal::Accepted { from: me }) {
                    warn!(remote = %from.short(), %error, "Dialer vanished before accept");
                    return;
                }
                self.table.lock().promote(from.clone(), ());
                self.emit(TransportEvent::ConnectionOpened(from));
            }
            Signal::Accepted { from } => {
                let promoted = {
                    let mut table = self.table.lock();
                    if table.is_pending(&from) {
                        table.promote(from.clone(), ());
                        true
                    } else {
                        false
                    }
                };
                if promoted {
                    self.emit(TransportEvent::ConnectionOpened(from));
                }
            }
            Signal::Frame { from, message } => {
                if self.table.lock().is_open(&from) {
                    self.emit(TransportEvent::Data { from, message });
                }
            }
            Signal::Close { from } => {
                let was_open = self.table.lock().remove(&from).is_some();
                if was_open {
                    self.emit(TransportEvent::ConnectionClosed(from));
                }
            }
        }
    }

    fn fail_connection(&self, peer: &PeerId, error: ShareError) {
        self.table.lock().remove(peer);
        self.emit(TransportEvent::ConnectionError {
            peer: peer.clone(),
            error,
        });
    }

    fn shutdown(&self) {
        let me = self.local_id.lock().take();
        let drained = self.table.lock().drain();
        if let Some(me) = &me {
            for (peer, ()) in drained {
                let _ = self.network.deliver(&peer, Signal::Close { from: me.clone() });
            }
            self.network.unregister(me);
        }
        self.events.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(me) = self.local_id.get_mut().take() {
            self.network.unregister(&me);
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local_id", &self.inner.me())
            .field("open", &self.inner.table.lock().open_count())
            .finish()
    }
}

impl LoopbackTransport {
    /// Register an endpoint and start its inbox task
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(network: LoopbackNetwork, forced_id: Option<&str>) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let id = match forced_id {
            Some(room) => PeerId::from(room),
            None => PeerId::new(format!("peer-{:016x}", rand::random::<u64>())),
        };

        let inner = Arc::new(Inner {
            network: network.clone(),
            local_id: Mutex::new(None),
            table: Mutex::new(ConnectionTable::new()),
            events: Mutex::new(Some(events_tx)),
            task: Mutex::new(None),
        });

        match network.register(&id, inbox_tx) {
            Ok(()) => {
                info!(local = %id, "Loopback endpoint opened");
                *inner.local_id.lock() = Some(id.clone());
                inner.emit(TransportEvent::Opened(id));
                let task = tokio::spawn(run_inbox(Arc::downgrade(&inner), inbox_rx));
                *inner.task.lock() = Some(task);
            }
            Err(error) => {
                warn!(local = %id, %error, "Loopback endpoint failed to open");
                inner.emit(TransportEvent::EndpointError(error));
            }
        }

        (Self { inner }, events_rx)
    }
}

async fn run_inbox(inner: Weak<Inner>, mut inbox: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(signal);
    }
}

impl PeerTransport for LoopbackTransport {
    fn local_id(&self) -> Option<PeerId> {
        self.inner.me()
    }

    fn connect(&self, remote: &PeerId) {
        let Some(me) = self.inner.me() else {
            warn!(remote = %remote, "Connect requested before endpoint opened");
            return;
        };
        if !self.inner.table.lock().begin(remote.clone()) {
            debug!(remote = %remote.short(), "Connection already pending or open");
            return;
        }
        debug!(local = %me.short(), remote = %remote.short(), "Dialing loopback peer");
        if let Err(error) = self.inner.network.deliver(remote, Signal::Connect { from: me }) {
            self.inner.fail_connection(remote, error);
        }
    }

    fn send(&self, peer: &PeerId, message: &SyncMessage) -> bool {
        let Some(me) = self.inner.me() else {
            return false;
        };
        if !self.inner.table.lock().is_open(peer) {
            return false;
        }
        let signal = Signal::Frame {
            from: me,
            message: message.clone(),
        };
        match self.inner.network.deliver(peer, signal) {
            Ok(()) => true,
            Err(error) => {
                self.inner.fail_connection(peer, error);
                false
            }
        }
    }

    fn broadcast(&self, message: &SyncMessage) -> usize {
        self.open_connections()
            .iter()
            .filter(|peer| self.send(peer, message))
            .count()
    }

    fn close(&self, peer: &PeerId) {
        let was_open = self.inner.table.lock().remove(peer).is_some();
        if let (true, Some(me)) = (was_open, self.inner.me()) {
            let _ = self.inner.network.deliver(peer, Signal::Close { from: me });
        }
    }

    fn close_all(&self) {
        let drained = self.inner.table.lock().drain();
        if let Some(me) = self.inner.me() {
            for (peer, ()) in drained {
                let _ = self.inner.network.deliver(&peer, Signal::Close { from: me.clone() });
            }
        }
    }

    fn destroy(&self) {
        self.inner.shutdown();
    }

    fn open_connections(&self) -> Vec<PeerId> {
        self.inner.table.lock().open_ids()
    }

    fn pending_connections(&self) -> Vec<PeerId> {
        self.inner.table.lock().pending_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(events: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_open_reports_identity() {
        let network = LoopbackNetwork::new();
        let (transport, mut events) = LoopbackTransport::open(network.clone(), Some("ird-team-1-2"));

        assert!(matches!(next(&mut events).await, TransportEvent::Opened(id) if id.as_str() == "ird-team-1-2"));
        assert_eq!(transport.local_id(), Some(PeerId::from("ird-team-1-2")));
        assert_eq!(network.identities(), vec![PeerId::from("ird-team-1-2")]);
    }

    #[tokio::test]
    async fn test_identity_collision() {
        let network = LoopbackNetwork::new();
        let (_first, _first_events) = LoopbackTransport::open(network.clone(), Some("room"));
        let (second, mut events) = LoopbackTransport::open(network.clone(), Some("room"));

        match next(&mut events).await {
            TransportEvent::EndpointError(ShareError::IdentityTaken(id)) => assert_eq!(id, "room"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(second.local_id().is_none());
    }

    #[tokio::test]
    async fn test_identity_is_released_on_destroy() {
        let network = LoopbackNetwork::new();
        let (first, _events) = LoopbackTransport::open(network.clone(), Some("room"));
        first.destroy();

        let (_second, mut events) = LoopbackTransport::open(network.clone(), Some("room"));
        assert!(matches!(next(&mut events).await, TransportEvent::Opened(_)));
    }

    #[tokio::test]
    async fn test_connect_send_close() {
        let network = LoopbackNetwork::new();
        let (host, mut host_events) = LoopbackTransport::open(network.clone(), Some("host"));
        let (guest, mut guest_events) = LoopbackTransport::open(network.clone(), None);
        next(&mut host_events).await;
        let guest_id = match next(&mut guest_events).await {
            TransportEvent::Opened(id) => id,
            other => panic!("unexpected event: {other:?}"),
        };

        guest.connect(&PeerId::from("host"));
        assert_eq!(guest.pending_connections(), vec![PeerId::from("host")]);

        assert!(matches!(next(&mut host_events).await, TransportEvent::ConnectionOpened(id) if id == guest_id));
        assert!(matches!(next(&mut guest_events).await, TransportEvent::ConnectionOpened(id) if id.as_str() == "host"));
        assert!(guest.pending_connections().is_empty());

        assert_eq!(host.broadcast(&SyncMessage::KeepAlive(5)), 1);
        match next(&mut guest_events).await {
            TransportEvent::Data { from, message } => {
                assert_eq!(from.as_str(), "host");
                assert_eq!(message, SyncMessage::KeepAlive(5));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        guest.close(&PeerId::from("host"));
        guest.close(&PeerId::from("host"));
        assert!(matches!(next(&mut host_events).await, TransportEvent::ConnectionClosed(id) if id == guest_id));
        assert!(host.open_connections().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_missing_peer_fails_that_connection_only() {
        let network = LoopbackNetwork::new();
        let (guest, mut events) = LoopbackTransport::open(network, None);
        next(&mut events).await;

        guest.connect(&PeerId::from("nobody"));
        match next(&mut events).await {
            TransportEvent::ConnectionError { peer, error } => {
                assert_eq!(peer.as_str(), "nobody");
                assert!(matches!(error, ShareError::PeerUnavailable(_)));
                assert!(!error.is_terminal());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(guest.pending_connections().is_empty());
        assert!(guest.local_id().is_some());
    }

    #[tokio::test]
    async fn test_send_to_unopened_connection_is_dropped() {
        let network = LoopbackNetwork::new();
        let (host, _events) = LoopbackTransport::open(network, Some("host"));
        assert!(!host.send(&PeerId::from("guest"), &SyncMessage::RequestSync));
        assert_eq!(host.broadcast(&SyncMessage::RequestSync), 0);
    }
}
