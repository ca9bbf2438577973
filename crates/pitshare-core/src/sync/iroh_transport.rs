//! QUIC peer transport on iroh
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  IrohTransport (one per sharing session)                        │
//! │  ├── Endpoint (QUIC transport, NAT traversal)                   │
//! │  ├── Router accepting SYNC_ALPN → SyncProtocolHandler           │
//! │  └── ConnectionTable<Link>                                      │
//! │                                                                 │
//! │  Link (per remote identity)                                     │
//! │  ├── one bidirectional stream, length-delimited JSON frames     │
//! │  ├── writer task draining an unbounded queue                    │
//! │  └── reader task emitting TransportEvent::Data                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identities
//!
//! A host that opens under a room id (for example `ird-team-4412-7`) derives
//! its endpoint secret key from the room name, so any teammate that knows the
//! room can compute the host's endpoint id. A remote id that already parses as
//! an endpoint id is dialed directly.
//!
//! Two hosts can bind the same room key on different machines; QUIC has no
//! registry to refuse the second one, so identity collisions are not reported
//! by this transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, ConnectionError, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ShareError, ShareResult};
use crate::sync::protocol::SyncMessage;
use crate::sync::transport::{
    ConnectionTable, EventReceiver, EventSender, PeerTransport, TransportEvent, TransportFactory,
};
use crate::types::PeerId;

/// ALPN protocol identifier for team-sharing links
pub const SYNC_ALPN: &[u8] = b"/pitshare/sync/1";

/// Protocol name carried in the hello frame
const HELLO_PROTOCOL: &str = "pitshare/1";

/// Key-derivation context for room secret keys
const ROOM_KEY_CONTEXT: &str = "pitshare 2024 room endpoint key";

/// Upper bound on a single frame. Sessions with full driver lists are the
/// largest messages and stay far below this.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

static NEXT_LINK_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Derive the endpoint secret key that hosts a room
pub fn room_secret_key(room: &str) -> SecretKey {
    SecretKey::from_bytes(&blake3::derive_key(ROOM_KEY_CONTEXT, room.as_bytes()))
}

/// Endpoint id to dial for a remote identity
///
/// Identities that are already endpoint ids are used as-is; anything else is
/// treated as a room name.
pub fn resolve_endpoint_id(remote: &PeerId) -> EndpointId {
    match remote.as_str().parse::<EndpointId>() {
        Ok(id) => id,
        Err(_) => room_secret_key(remote.as_str()).public(),
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// First frame on every stream, written by the dialer
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    protocol: String,
    /// The dialer's own identity, used as the connection key on the acceptor
    peer: String,
}

impl Hello {
    fn new(peer: &PeerId) -> Self {
        Self {
            protocol: HELLO_PROTOCOL.to_string(),
            peer: peer.to_string(),
        }
    }

    fn validate(bytes: &[u8]) -> ShareResult<PeerId> {
        let hello: Hello = serde_json::from_slice(bytes)
            .map_err(|e| ShareError::Protocol(format!("Malformed hello frame: {}", e)))?;
        if hello.protocol != HELLO_PROTOCOL {
            return Err(ShareError::Protocol(format!(
                "Unsupported protocol {:?}, expected {:?}",
                hello.protocol, HELLO_PROTOCOL
            )));
        }
        if hello.peer.is_empty() {
            return Err(ShareError::Protocol("Hello frame carries no identity".to_string()));
        }
        Ok(PeerId::new(hello.peer))
    }
}

/// Builds [`IrohTransport`]s, carrying out-of-band peer addresses
#[derive(Debug, Clone, Default)]
pub struct IrohTransportFactory {
    peer_addrs: Vec<EndpointAddr>,
}

impl IrohTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a peer reachable without discovery, e.g. a teammate on the LAN
    pub fn with_peer_addr(mut self, addr: EndpointAddr) -> Self {
        self.peer_addrs.push(addr);
        self
    }
}

impl TransportFactory for IrohTransportFactory {
    fn open(&self, forced_id: Option<&str>) -> (Arc<dyn PeerTransport>, EventReceiver) {
        let (transport, events) = IrohTransport::open(forced_id, self.peer_addrs.clone());
        (Arc::new(transport), events)
    }
}

/// One open connection
struct Link {
    serial: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Stop reading and let the writer finish the stream and close the
    /// connection
    fn shutdown(self) {
        self.reader.abort();
        drop(self.outbound);
    }
}

struct Shared {
    local_id: Mutex<Option<PeerId>>,
    endpoint: Mutex<Option<Endpoint>>,
    router: Mutex<Option<Router>>,
    static_provider: StaticProvider,
    table: Mutex<ConnectionTable<Link>>,
    events: Mutex<Option<EventSender>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Register a connection whose hello exchange is done
    fn attach(
        self: &Arc<Self>,
        peer: PeerId,
        connection: Connection,
        writer: FramedWrite<SendStream, LengthDelimitedCodec>,
        reader: FramedRead<RecvStream, LengthDelimitedCodec>,
        dialed: bool,
    ) {
        if self.destroyed.load(Ordering::SeqCst) {
            connection.close(0u32.into(), b"shutting down");
            return;
        }

        let serial = NEXT_LINK_SERIAL.fetch_add(1, Ordering::Relaxed);
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(peer.clone(), connection.clone(), writer, queue));
        let reader = tokio::spawn(run_reader(
            Arc::downgrade(self),
            peer.clone(),
            serial,
            connection,
            reader,
        ));
        let link = Link {
            serial,
            outbound,
            reader,
        };

        let replaced = {
            let mut table = self.table.lock();
            // A dial that was cancelled while in flight is not resurrected
            if dialed && !table.is_pending(&peer) {
                drop(table);
                link.shutdown();
                debug!(remote = %peer.short(), "Dial finished after cancel, dropping link");
                return;
            }
            table.promote(peer.clone(), link)
        };
        if let Some(old) = replaced {
            old.shutdown();
        }

        info!(remote = %peer.short(), dialed, "Sync connection open");
        self.emit(TransportEvent::ConnectionOpened(peer));
    }

    /// Reader for a link stopped; forget it if it is still the current one
    fn link_ended(&self, peer: &PeerId, serial: u64, failure: Option<ShareError>) {
        let link = {
            let mut table = self.table.lock();
            match table.get(peer) {
                Some(link) if link.serial == serial => table.remove(peer),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };
        drop(link.outbound);

        match failure {
            None => {
                info!(remote = %peer.short(), "Sync connection closed");
                self.emit(TransportEvent::ConnectionClosed(peer.clone()));
            }
            Some(error) => {
                warn!(remote = %peer.short(), %error, "Sync connection failed");
                self.emit(TransportEvent::ConnectionError {
                    peer: peer.clone(),
                    error,
                });
            }
        }
    }

    fn dial_failed(&self, peer: &PeerId, error: ShareError) {
        let was_pending = {
            let mut table = self.table.lock();
            let pending = table.is_pending(peer);
            if pending {
                table.remove(peer);
            }
            pending
        };
        if was_pending {
            warn!(remote = %peer.short(), %error, "Dial failed");
            self.emit(TransportEvent::ConnectionError {
                peer: peer.clone(),
                error,
            });
        }
    }
}

/// Team-sharing transport over iroh QUIC connections
#[derive(Clone)]
pub struct IrohTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("local_id", &*self.shared.local_id.lock())
            .field("open", &self.shared.table.lock().open_count())
            .finish()
    }
}

impl IrohTransport {
    /// Start binding an endpoint
    ///
    /// Must be called from within a tokio runtime. Reports
    /// [`TransportEvent::Opened`] once the endpoint and router are up.
    pub fn open(forced_id: Option<&str>, peer_addrs: Vec<EndpointAddr>) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let static_provider = StaticProvider::new();
        for addr in peer_addrs {
            static_provider.add_endpoint_info(addr);
        }

        let shared = Arc::new(Shared {
            local_id: Mutex::new(None),
            endpoint: Mutex::new(None),
            router: Mutex::new(None),
            static_provider,
            table: Mutex::new(ConnectionTable::new()),
            events: Mutex::new(Some(events_tx)),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });

        let forced = forced_id.map(PeerId::from);
        let bind = tokio::spawn(bind_endpoint(shared.clone(), forced));
        shared.track(bind);

        (Self { shared }, events_rx)
    }

    /// Add a peer's address to static discovery
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        info!(peer = %addr.id, addrs = addr.addrs.len(), "Adding peer address to static discovery");
        self.shared.static_provider.add_endpoint_info(addr);
    }

    /// Full address of the local endpoint, once bound
    pub fn endpoint_addr(&self) -> Option<EndpointAddr> {
        self.shared.endpoint.lock().as_ref().map(|e| e.addr())
    }
}

async fn bind_endpoint(shared: Arc<Shared>, forced: Option<PeerId>) {
    let secret_key = match &forced {
        Some(room) => room_secret_key(room.as_str()),
        None => SecretKey::generate(&mut rand::rng()),
    };

    let endpoint = match Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![SYNC_ALPN.to_vec()])
        .discovery(shared.static_provider.clone())
        .bind()
        .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "Failed to bind endpoint");
            shared.emit(TransportEvent::EndpointError(ShareError::Endpoint(format!(
                "Failed to bind endpoint: {}",
                e
            ))));
            return;
        }
    };

    if shared.destroyed.load(Ordering::SeqCst) {
        endpoint.close().await;
        return;
    }

    let endpoint_id = endpoint.id();
    let handler = SyncProtocolHandler {
        shared: Arc::downgrade(&shared),
    };
    let router = Router::builder(endpoint.clone())
        .accept(SYNC_ALPN, handler)
        .spawn();

    let local_id = forced.unwrap_or_else(|| PeerId::new(endpoint_id.to_string()));
    info!(%endpoint_id, local = %local_id, "Sync endpoint bound");

    *shared.endpoint.lock() = Some(endpoint);
    *shared.router.lock() = Some(router);
    *shared.local_id.lock() = Some(local_id.clone());
    shared.emit(TransportEvent::Opened(local_id));
}

async fn dial(shared: Arc<Shared>, local: PeerId, remote: PeerId) {
    let Some(endpoint) = shared.endpoint.lock().clone() else {
        shared.dial_failed(&remote, ShareError::InvalidOperation("Endpoint not bound".to_string()));
        return;
    };

    match open_link(&endpoint, &local, &remote).await {
        Ok((connection, writer, reader)) => shared.attach(remote, connection, writer, reader, true),
        Err(error) => shared.dial_failed(&remote, error),
    }
}

async fn open_link(
    endpoint: &Endpoint,
    local: &PeerId,
    remote: &PeerId,
) -> ShareResult<(
    Connection,
    FramedWrite<SendStream, LengthDelimitedCodec>,
    FramedRead<RecvStream, LengthDelimitedCodec>,
)> {
    let target = resolve_endpoint_id(remote);
    debug!(remote = %remote.short(), %target, "Dialing sync peer");

    let connection = endpoint
        .connect(target, SYNC_ALPN)
        .await
        .map_err(|e| ShareError::PeerUnavailable(format!("{}: {}", remote, e)))?;

    let (send, recv) = connection.open_bi().await.map_err(|e| ShareError::Connection {
        peer: remote.to_string(),
        reason: format!("Failed to open bi stream: {}", e),
    })?;

    let mut writer = FramedWrite::new(send, codec());
    let hello = serde_json::to_vec(&Hello::new(local))?;
    writer.send(Bytes::from(hello)).await.map_err(|e| ShareError::Connection {
        peer: remote.to_string(),
        reason: format!("Failed to send hello: {}", e),
    })?;

    Ok((connection, writer, FramedRead::new(recv, codec())))
}

async fn run_writer(
    peer: PeerId,
    connection: Connection,
    mut writer: FramedWrite<SendStream, LengthDelimitedCodec>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = queue.recv().await {
        let len = frame.len();
        if let Err(e) = writer.send(frame).await {
            debug!(remote = %peer.short(), error = %e, "Write failed, stopping writer");
            break;
        }
        trace!(remote = %peer.short(), bytes = len, "Frame written");
    }
    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    connection.close(0u32.into(), b"closed");
}

async fn run_reader(
    shared: Weak<Shared>,
    peer: PeerId,
    serial: u64,
    connection: Connection,
    mut reader: FramedRead<RecvStream, LengthDelimitedCodec>,
) {
    let failure = loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match SyncMessage::decode(&frame) {
                    Ok(message) => {
                        trace!(remote = %peer.short(), kind = %message.kind(), bytes = frame.len(), "Frame received");
                        shared.emit(TransportEvent::Data {
                            from: peer.clone(),
                            message,
                        });
                    }
                    Err(e) => warn!(remote = %peer.short(), error = %e, "Dropping undecodable frame"),
                }
            }
            Some(Err(e)) => {
                let closed_by_peer = matches!(
                    connection.close_reason(),
                    Some(ConnectionError::ApplicationClosed(_)) | Some(ConnectionError::LocallyClosed)
                );
                if closed_by_peer {
                    break None;
                }
                break Some(ShareError::Connection {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
            }
            None => break None,
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.link_ended(&peer, serial, failure);
    }
}

/// Router handler for incoming sync connections
#[derive(Clone)]
struct SyncProtocolHandler {
    shared: Weak<Shared>,
}

impl std::fmt::Debug for SyncProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocolHandler").finish_non_exhaustive()
    }
}

impl SyncProtocolHandler {
    async fn handle_connection(connection: Connection, shared: Weak<Shared>) -> ShareResult<()> {
        let remote_id = connection.remote_id();
        debug!(%remote_id, "Handling incoming sync connection");

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| ShareError::Network(format!("Failed to accept bi stream: {}", e)))?;

        let mut reader = FramedRead::new(recv, codec());
        let hello = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(ShareError::Protocol(format!("Failed to read hello: {}", e))),
            None => return Err(ShareError::Protocol("Stream ended before hello".to_string())),
        };
        let peer = match Hello::validate(&hello) {
            Ok(peer) => peer,
            Err(e) => {
                connection.close(1u32.into(), b"bad hello");
                return Err(e);
            }
        };

        {
            let Some(shared) = shared.upgrade() else {
                return Ok(());
            };
            shared.attach(
                peer,
                connection.clone(),
                FramedWrite::new(send, codec()),
                reader,
                false,
            );
        }

        // Keep the handler alive for the lifetime of the connection
        connection.closed().await;
        Ok(())
    }
}

impl ProtocolHandler for SyncProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let shared = self.shared.clone();

        async move {
            if let Err(e) = Self::handle_connection(conn, shared).await {
                warn!(error = %e, "Failed to handle sync connection");
                return Err(AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

impl PeerTransport for IrohTransport {
    fn local_id(&self) -> Option<PeerId> {
        self.shared.local_id.lock().clone()
    }

    fn connect(&self, remote: &PeerId) {
        let Some(local) = self.local_id() else {
            warn!(remote = %remote, "Connect requested before endpoint opened");
            return;
        };
        if !self.shared.table.lock().begin(remote.clone()) {
            debug!(remote = %remote.short(), "Connection already pending or open");
            return;
        }
        let task = tokio::spawn(dial(self.shared.clone(), local, remote.clone()));
        self.shared.track(task);
    }

    fn send(&self, peer: &PeerId, message: &SyncMessage) -> bool {
        let frame = match message.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                return false;
            }
        };
        let table = self.shared.table.lock();
        match table.get(peer) {
            Some(link) => link.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, message: &SyncMessage) -> usize {
        let frame = match message.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                return 0;
            }
        };
        let table = self.shared.table.lock();
        table
            .iter_open()
            .filter(|(_, link)| link.outbound.send(frame.clone()).is_ok())
            .count()
    }

    fn close(&self, peer: &PeerId) {
        let link = self.shared.table.lock().remove(peer);
        if let Some(link) = link {
            debug!(remote = %peer.short(), "Closing sync connection");
            link.shutdown();
        }
    }

    fn close_all(&self) {
        let drained = self.shared.table.lock().drain();
        for (_, link) in drained {
            link.shutdown();
        }
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.events.lock().take();
        self.close_all();
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.local_id.lock().take();

        let router = self.shared.router.lock().take();
        let endpoint = self.shared.endpoint.lock().take();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(router) = router {
                    if let Err(e) = router.shutdown().await {
                        warn!(error = ?e, "Failed to shutdown router cleanly");
                    }
                }
                if let Some(endpoint) = endpoint {
                    endpoint.close().await;
                }
                info!("Sync endpoint closed");
            });
        }
    }

    fn open_connections(&self) -> Vec<PeerId> {
        self.shared.table.lock().open_ids()
    }

    fn pending_connections(&self) -> Vec<PeerId> {
        self.shared.table.lock().pending_ids()
    }
}
