//! Peer transport port
//!
//! The coordinator talks to the network only through [`PeerTransport`] and
//! learns about lifecycle changes from a stream of [`TransportEvent`]s. Two
//! adapters exist: [`IrohTransport`](crate::sync::IrohTransport) for real
//! QUIC links and [`LoopbackTransport`](crate::sync::LoopbackTransport) for
//! same-process sessions and tests.
//!
//! ## Connection lifecycle
//!
//! ```text
//!   connect()            open event            close()/error
//! ──────────▶ pending ───────────────▶ open ─────────────────▶ (gone)
//!                │                                  ▲
//!                └──────────── error ───────────────┘
//! ```
//!
//! An identity is never pending and open at the same time; the
//! [`ConnectionTable`] enforces this for every adapter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::ShareError;
use crate::sync::protocol::SyncMessage;
use crate::types::PeerId;

/// Lifecycle and data notifications from a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The local endpoint is ready and reachable under this identity
    Opened(PeerId),
    /// A connection (outgoing or incoming) finished its handshake
    ConnectionOpened(PeerId),
    /// A message arrived on an open connection
    Data {
        /// Remote identity of the connection
        from: PeerId,
        /// Decoded envelope
        message: SyncMessage,
    },
    /// A connection went away cleanly
    ConnectionClosed(PeerId),
    /// A single connection failed; other connections are unaffected
    ConnectionError {
        /// Remote identity of the failed connection
        peer: PeerId,
        /// Cause
        error: ShareError,
    },
    /// The endpoint itself failed; the session is over
    EndpointError(ShareError),
}

/// Sending half of a transport's event stream
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half of a transport's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One local network endpoint with many data connections
///
/// All methods are non-blocking. Work that needs the network is spawned and
/// reported back through the event stream. Sends to connections that are not
/// open are dropped; nothing is queued for later.
pub trait PeerTransport: Send + Sync + 'static {
    /// Identity of the local endpoint, once opened
    fn local_id(&self) -> Option<PeerId>;

    /// Start connecting to a remote identity. No-op when already pending or open.
    fn connect(&self, remote: &PeerId);

    /// Send to one open connection. Returns false when it is not open.
    fn send(&self, peer: &PeerId, message: &SyncMessage) -> bool;

    /// Send to every open connection, returning how many were reached
    fn broadcast(&self, message: &SyncMessage) -> usize;

    /// Close one connection. Idempotent.
    fn close(&self, peer: &PeerId);

    /// Close every connection, pending ones included. Idempotent.
    fn close_all(&self);

    /// Close everything and release the endpoint. No events follow.
    fn destroy(&self);

    /// Identities with an open connection
    fn open_connections(&self) -> Vec<PeerId>;

    /// Identities with a connection attempt in flight
    fn pending_connections(&self) -> Vec<PeerId>;
}

/// Creates one transport per sharing session
pub trait TransportFactory: Send + Sync + 'static {
    /// Open a new endpoint, optionally under a caller-chosen identity
    ///
    /// Must be called from within a tokio runtime. The endpoint reports
    /// [`TransportEvent::Opened`] or [`TransportEvent::EndpointError`] on the
    /// returned receiver.
    fn open(&self, forced_id: Option<&str>) -> (Arc<dyn PeerTransport>, EventReceiver);
}

/// Pending and open connection bookkeeping shared by the adapters
#[derive(Debug)]
pub struct ConnectionTable<H> {
    pending: BTreeSet<PeerId>,
    open: BTreeMap<PeerId, H>,
}

impl<H> Default for ConnectionTable<H> {
    fn default() -> Self {
        Self {
            pending: BTreeSet::new(),
            open: BTreeMap::new(),
        }
    }
}

impl<H> ConnectionTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an attempt as in flight. Returns false if the identity is already
    /// pending or open.
    pub fn begin(&mut self, peer: PeerId) -> bool {
        if self.open.contains_key(&peer) {
            return false;
        }
        self.pending.insert(peer)
    }

    /// Move an identity to open, replacing any previous handle
    ///
    /// Returns the replaced handle so the caller can shut it down.
    pub fn promote(&mut self, peer: PeerId, handle: H) -> Option<H> {
        self.pending.remove(&peer);
        self.open.insert(peer, handle)
    }

    /// Forget an identity in either state, returning its open handle if any
    pub fn remove(&mut self, peer: &PeerId) -> Option<H> {
        self.pending.remove(peer);
        self.open.remove(peer)
    }

    /// Forget everything, returning all open handles
    pub fn drain(&mut self) -> Vec<(PeerId, H)> {
        self.pending.clear();
        std::mem::take(&mut self.open).into_iter().collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&H> {
        self.open.get(peer)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.open.contains_key(peer)
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.pending.contains(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.is_open(peer) || self.is_pending(peer)
    }

    pub fn open_ids(&self) -> Vec<PeerId> {
        self.open.keys().cloned().collect()
    }

    pub fn pending_ids(&self) -> Vec<PeerId> {
        self.pending.iter().cloned().collect()
    }

    /// Iterate over open connections
    pub fn iter_open(&self) -> impl Iterator<Item = (&PeerId, &H)> {
        self.open.iter()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[test]
    fn test_begin_then_promote_is_exclusive() {
        let mut table = ConnectionTable::new();
        assert!(table.begin(peer("host")));
        assert!(table.is_pending(&peer("host")));
        assert!(!table.begin(peer("host")));

        assert!(table.promote(peer("host"), 1u32).is_none());
        assert!(table.is_open(&peer("host")));
        assert!(!table.is_pending(&peer("host")));

        // Already open: a second attempt is refused
        assert!(!table.begin(peer("host")));
        assert!(!table.is_pending(&peer("host")));
    }

    #[test]
    fn test_promote_replaces_handle() {
        let mut table = ConnectionTable::new();
        table.promote(peer("a"), 1u32);
        assert_eq!(table.promote(peer("a"), 2u32), Some(1));
        assert_eq!(table.get(&peer("a")), Some(&2));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut table = ConnectionTable::new();
        table.begin(peer("p"));
        table.promote(peer("o"), ());

        assert!(table.remove(&peer("p")).is_none());
        assert!(!table.contains(&peer("p")));
        assert!(table.remove(&peer("o")).is_some());
        assert!(table.remove(&peer("o")).is_none());
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_drain_clears_both_states() {
        let mut table = ConnectionTable::new();
        table.begin(peer("p"));
        table.promote(peer("a"), 'a');
        table.promote(peer("b"), 'b');

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.pending_ids().is_empty());
        assert!(table.open_ids().is_empty());
    }
}
