//! Shared test doubles for coordinator integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use pitshare_core::error::{ShareError, ShareResult};
use pitshare_core::sync::{
    BridgeEvent, BridgeEvents, ConnectionTable, EventReceiver, EventSender, MessageKind,
    PeerTransport, StatusBridge, SyncMessage, TransportEvent, TransportFactory,
};
use pitshare_core::types::{PeerId, StatusSnapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One recorded outgoing message
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    /// `None` for broadcasts
    pub to: Option<PeerId>,
    pub message: SyncMessage,
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Sent>>,
    opens: Mutex<Vec<Option<String>>>,
    current: Mutex<Option<(Arc<RecordingTransport>, EventSender)>>,
    refuse_next_open: Mutex<bool>,
    destroyed: Mutex<usize>,
}

/// Transport factory that records every send instead of touching a network
#[derive(Clone, Default)]
pub struct RecordingFactory {
    recorder: Arc<Recorder>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.recorder.sent.lock().clone()
    }

    pub fn sent_of(&self, kind: MessageKind) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.message.kind() == kind)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.recorder.sent.lock().clear();
    }

    /// Room ids passed to every `open` so far
    pub fn opens(&self) -> Vec<Option<String>> {
        self.recorder.opens.lock().clone()
    }

    pub fn destroyed(&self) -> usize {
        *self.recorder.destroyed.lock()
    }

    /// Make the next endpoint fail as if its identity were in use
    pub fn refuse_next_open(&self) {
        *self.recorder.refuse_next_open.lock() = true;
    }

    pub fn current(&self) -> Option<Arc<RecordingTransport>> {
        self.recorder.current.lock().as_ref().map(|(t, _)| t.clone())
    }

    /// Push an event into the most recently opened transport's stream
    pub fn inject(&self, event: TransportEvent) {
        if let Some((_, events)) = self.recorder.current.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Simulate a remote peer finishing its handshake
    pub fn accept_peer(&self, peer: &str) {
        if let Some(transport) = self.current() {
            transport.table.lock().promote(PeerId::from(peer), ());
        }
        self.inject(TransportEvent::ConnectionOpened(PeerId::from(peer)));
    }

    /// Simulate a message arriving from a remote peer
    pub fn receive(&self, from: &str, message: SyncMessage) {
        self.inject(TransportEvent::Data {
            from: PeerId::from(from),
            message,
        });
    }
}

impl TransportFactory for RecordingFactory {
    fn open(&self, forced_id: Option<&str>) -> (Arc<dyn PeerTransport>, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut opens = self.recorder.opens.lock();
        opens.push(forced_id.map(str::to_string));
        let id = forced_id
            .map(PeerId::from)
            .unwrap_or_else(|| PeerId::new(format!("recorder-{}", opens.len())));
        drop(opens);

        let transport = Arc::new(RecordingTransport {
            recorder: self.recorder.clone(),
            local: Mutex::new(None),
            table: Mutex::new(ConnectionTable::new()),
            connects: Mutex::new(Vec::new()),
        });

        let refuse = std::mem::take(&mut *self.recorder.refuse_next_open.lock());
        if refuse {
            let _ = events_tx.send(TransportEvent::EndpointError(ShareError::IdentityTaken(
                id.to_string(),
            )));
        } else {
            *transport.local.lock() = Some(id.clone());
            let _ = events_tx.send(TransportEvent::Opened(id));
        }

        *self.recorder.current.lock() = Some((transport.clone(), events_tx));
        (transport, events_rx)
    }
}

/// Transport half of [`RecordingFactory`]
pub struct RecordingTransport {
    recorder: Arc<Recorder>,
    local: Mutex<Option<PeerId>>,
    table: Mutex<ConnectionTable<()>>,
    connects: Mutex<Vec<PeerId>>,
}

impl RecordingTransport {
    /// Every identity `connect` was called with
    pub fn connects(&self) -> Vec<PeerId> {
        self.connects.lock().clone()
    }

    fn record(&self, to: Option<PeerId>, message: &SyncMessage) {
        self.recorder.sent.lock().push(Sent {
            at: Instant::now(),
            to,
            message: message.clone(),
        });
    }
}

impl PeerTransport for RecordingTransport {
    fn local_id(&self) -> Option<PeerId> {
        self.local.lock().clone()
    }

    fn connect(&self, remote: &PeerId) {
        self.connects.lock().push(remote.clone());
        self.table.lock().begin(remote.clone());
    }

    fn send(&self, peer: &PeerId, message: &SyncMessage) -> bool {
        if !self.table.lock().is_open(peer) {
            return false;
        }
        self.record(Some(peer.clone()), message);
        true
    }

    fn broadcast(&self, message: &SyncMessage) -> usize {
        self.record(None, message);
        self.table.lock().open_count()
    }

    fn close(&self, peer: &PeerId) {
        self.table.lock().remove(peer);
    }

    fn close_all(&self) {
        self.table.lock().drain();
    }

    fn destroy(&self) {
        self.table.lock().drain();
        self.local.lock().take();
        *self.recorder.destroyed.lock() += 1;
    }

    fn open_connections(&self) -> Vec<PeerId> {
        self.table.lock().open_ids()
    }

    fn pending_connections(&self) -> Vec<PeerId> {
        self.table.lock().pending_ids()
    }
}

/// A careless bridge: every status push is immediately announced back to
/// every subscriber, the pusher included
#[derive(Default)]
pub struct EchoBridge {
    status: Mutex<StatusSnapshot>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>,
    pub status_pushes: Mutex<Vec<StatusSnapshot>>,
    pub data_pushes: Mutex<Vec<SyncMessage>>,
}

impl EchoBridge {
    pub fn with_status(status: StatusSnapshot) -> Self {
        Self {
            status: Mutex::new(status),
            ..Default::default()
        }
    }

    /// Simulate another window announcing a status
    pub fn announce(&self, status: StatusSnapshot) {
        *self.status.lock() = status.clone();
        for tx in self.subscribers.lock().iter() {
            let _ = tx.send(BridgeEvent::StatusChanged(status.clone()));
        }
    }

    /// Simulate another window rebroadcasting data
    pub fn deliver(&self, message: SyncMessage) {
        for tx in self.subscribers.lock().iter() {
            let _ = tx.send(BridgeEvent::Data(message.clone()));
        }
    }
}

impl StatusBridge for EchoBridge {
    fn get_status(&self) -> ShareResult<StatusSnapshot> {
        Ok(self.status.lock().clone())
    }

    fn update_status(&self, status: StatusSnapshot) -> ShareResult<()> {
        self.status_pushes.lock().push(status.clone());
        self.announce(status);
        Ok(())
    }

    fn broadcast_data(&self, message: SyncMessage) -> ShareResult<()> {
        self.data_pushes.lock().push(message.clone());
        self.deliver(message);
        Ok(())
    }

    fn subscribe(&self) -> ShareResult<BridgeEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

/// Let spawned tasks drain their queues without moving the clock
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// A telemetry record in the simulator's wrapped shape
pub fn wrapped_telemetry(fuel: f64) -> serde_json::Map<String, serde_json::Value> {
    serde_json::json!({
        "FuelLevel": {"value": [fuel]},
        "Lap": {"value": [12]},
        "SteeringWheelAngle": {"value": [0.25]},
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

/// A minimal team-race session snapshot
pub fn team_session() -> serde_json::Value {
    serde_json::json!({
        "WeekendInfo": {"SessionID": 4412, "TeamRacing": 1},
        "DriverInfo": {"DriverCarIdx": 3, "Drivers": [{"CarIdx": 3, "TeamID": 7}]},
        "SessionInfo": {"Sessions": []},
        "CameraInfo": {"Groups": []},
    })
}
