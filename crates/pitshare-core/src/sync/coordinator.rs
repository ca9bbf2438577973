//! Role state machine for team sharing
//!
//! The [`RoleCoordinator`] owns the authoritative role of this process and
//! everything that hangs off it: the transport session, the host broadcast
//! cycle, the keep-alive ticker, the latest snapshots and the fan-out of
//! received data to local subscribers, sibling windows and the status bridge.
//!
//! ```text
//!                 start_hosting()
//!        ┌─────────────────────────────────┐
//!        │                                 ▼
//!     ┌──────┐   join_session()   ┌──────┐  ┌──────┐
//!     │ Idle │───────────────────▶│Guest │  │ Host │
//!     └──────┘◀───────────────────└──────┘  └──────┘
//!        ▲      stop() / endpoint error         │
//!        └──────────────────────────────────────┘
//! ```
//!
//! Every role entry opens a new transport session tagged with an epoch. The
//! event pump and both timers carry the epoch they were started under and
//! re-check it (together with the role) each time they fire, so work armed
//! under a superseded session never runs.
//!
//! State is behind a single mutex that is never held while user callbacks
//! run, so callbacks may call back into the coordinator, `stop()` included.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ShareConfig;
use crate::normalize::{DataNormalizer, TelemetryRecord};
use crate::sync::bridge::{BridgeEvent, BridgeEvents, StatusBridge};
use crate::sync::events::{relay_targets, DataEvent, Origin, RelayTargets};
use crate::sync::listeners::{Listeners, Subscription};
use crate::sync::protocol::{FuelLap, SyncMessage};
use crate::sync::relay::{LocalRelayBus, RelayPort, RelayReceiver, RelaySender};
use crate::sync::transport::{EventReceiver, PeerTransport, TransportEvent, TransportFactory};
use crate::types::{PeerId, Role, StatusSnapshot};

#[derive(Default)]
struct State {
    role: Role,
    epoch: u64,
    peer_id: Option<PeerId>,
    /// Room id requested by the current host session
    forced_id: Option<String>,
    /// Host identity the current guest session dials
    host_target: Option<PeerId>,
    /// Last status reported by another window
    remote: StatusSnapshot,
    transport: Option<Arc<dyn PeerTransport>>,
    telemetry: Option<TelemetryRecord>,
    session: Option<Value>,
    fuel_history: Option<Vec<FuelLap>>,
    last_session_sent: Option<Instant>,
    last_data_at: Option<Instant>,
    last_network_at: Option<Instant>,
    session_tasks: Vec<JoinHandle<()>>,
}

impl State {
    fn local_status(&self) -> StatusSnapshot {
        StatusSnapshot::new(self.role, self.peer_id.clone())
    }

    fn merged_status(&self) -> StatusSnapshot {
        if self.role.is_active() {
            self.local_status()
        } else {
            self.remote.clone()
        }
    }
}

struct Inner {
    config: ShareConfig,
    normalizer: DataNormalizer,
    factory: Arc<dyn TransportFactory>,
    relay: Option<RelaySender>,
    bridge: Option<Arc<dyn StatusBridge>>,
    state: Mutex<State>,
    data_listeners: Listeners<DataEvent>,
    status_listeners: Listeners<StatusSnapshot>,
    peer_listeners: Listeners<PeerId>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for pump in self.pumps.get_mut().drain(..) {
            pump.abort();
        }
        let state = self.state.get_mut();
        for task in state.session_tasks.drain(..) {
            task.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.destroy();
        }
    }
}

/// Builder for [`RoleCoordinator`]
pub struct CoordinatorBuilder {
    factory: Arc<dyn TransportFactory>,
    config: ShareConfig,
    relay: Option<RelayPort>,
    bridge: Option<Arc<dyn StatusBridge>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: ShareConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach this coordinator's window to a local relay bus
    pub fn relay_bus(mut self, bus: &LocalRelayBus) -> Self {
        self.relay = Some(bus.attach());
        self
    }

    /// Use an already attached relay port
    pub fn relay_port(mut self, port: RelayPort) -> Self {
        self.relay = Some(port);
        self
    }

    /// Connect to the backend status bridge
    pub fn bridge(mut self, bridge: Arc<dyn StatusBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Build the coordinator
    ///
    /// Must be called from within a tokio runtime: the local bus and bridge
    /// listeners run as background tasks. When a bridge is present its
    /// current status is adopted as the remote status.
    pub fn build(self) -> RoleCoordinator {
        let normalizer = DataNormalizer::new(self.config.max_drivers, self.config.unwrap_depth);

        let (relay_tx, relay_rx) = match self.relay {
            Some(port) => {
                let (tx, rx) = port.split();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let (bridge_events, initial_remote) = match &self.bridge {
            Some(bridge) => {
                let events = bridge
                    .subscribe()
                    .map_err(|e| warn!(error = %e, "Could not subscribe to status bridge"))
                    .ok();
                let status = bridge
                    .get_status()
                    .map_err(|e| warn!(error = %e, "Could not read status from bridge"))
                    .ok();
                (events, status)
            }
            None => (None, None),
        };

        let inner = Arc::new(Inner {
            config: self.config,
            normalizer,
            factory: self.factory,
            relay: relay_tx,
            bridge: self.bridge,
            state: Mutex::new(State::default()),
            data_listeners: Listeners::new(),
            status_listeners: Listeners::new(),
            peer_listeners: Listeners::new(),
            pumps: Mutex::new(Vec::new()),
        });

        {
            let mut pumps = inner.pumps.lock();
            if let Some(rx) = relay_rx {
                pumps.push(tokio::spawn(run_relay_pump(Arc::downgrade(&inner), rx)));
            }
            if let Some(events) = bridge_events {
                pumps.push(tokio::spawn(run_bridge_pump(Arc::downgrade(&inner), events)));
            }
        }

        if let Some(status) = initial_remote {
            inner.adopt_remote_status(status);
        }

        RoleCoordinator { inner }
    }
}

/// Authoritative owner of this process's sharing role
///
/// Cheap to clone; all clones drive the same state. Dropping the last clone
/// stops every background task and destroys the transport.
#[derive(Clone)]
pub struct RoleCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RoleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RoleCoordinator")
            .field("role", &state.role)
            .field("peer_id", &state.peer_id)
            .field("remote", &state.remote)
            .field("epoch", &state.epoch)
            .finish()
    }
}

impl RoleCoordinator {
    /// Start building a coordinator over the given transport factory
    pub fn builder(factory: Arc<dyn TransportFactory>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            factory,
            config: ShareConfig::default(),
            relay: None,
            bridge: None,
        }
    }

    /// Coordinator with default configuration, no relay bus and no bridge
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::builder(factory).build()
    }

    pub fn config(&self) -> &ShareConfig {
        &self.inner.config
    }

    // ========== Role transitions ==========

    /// Become host, optionally under a fixed room id
    ///
    /// No-op when already hosting with the same room id, or when no room id
    /// is given. Any previous session is torn down first. Status subscribers
    /// are notified once the endpoint is open.
    pub fn start_hosting(&self, forced_id: Option<&str>) {
        {
            let state = self.inner.state.lock();
            if state.role == Role::Host
                && (forced_id.is_none() || state.forced_id.as_deref() == forced_id)
            {
                debug!(room = ?forced_id, "Already hosting");
                return;
            }
        }

        let (previous, _) = self.inner.end_session(false);
        let (transport, events) = self.inner.factory.open(forced_id);

        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.role = Role::Host;
        state.forced_id = forced_id.map(str::to_string);
        state.transport = Some(transport);
        let pump = tokio::spawn(run_session(Arc::downgrade(&self.inner), state.epoch, events));
        state.session_tasks.push(pump);

        info!(room = ?forced_id, %previous, epoch = state.epoch, "Starting to host");
    }

    /// Become guest of the given host
    ///
    /// No-op when already guest of the same host and connected or connecting.
    /// A guest whose link to that host dropped dials again instead.
    pub fn join_session(&self, host_id: &str) {
        let host = PeerId::from(host_id);
        {
            let state = self.inner.state.lock();
            if state.role == Role::Guest && state.host_target.as_ref() == Some(&host) {
                let Some(transport) = state.transport.clone().filter(|_| state.peer_id.is_some()) else {
                    debug!(host = %host, "Join already in progress");
                    return;
                };
                drop(state);

                if transport.open_connections().contains(&host)
                    || transport.pending_connections().contains(&host)
                {
                    debug!(host = %host, "Already connected to host");
                } else {
                    info!(host = %host, "Reconnecting to host");
                    transport.connect(&host);
                }
                return;
            }
        }

        let (previous, _) = self.inner.end_session(false);
        let (transport, events) = self.inner.factory.open(None);

        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.role = Role::Guest;
        state.host_target = Some(host.clone());
        state.transport = Some(transport);
        let pump = tokio::spawn(run_session(Arc::downgrade(&self.inner), state.epoch, events));
        state.session_tasks.push(pump);

        info!(host = %host, %previous, epoch = state.epoch, "Joining session");
    }

    /// Return to idle
    ///
    /// Cancels both timers and closes every connection before returning.
    /// Status subscribers are notified only if the observable status changed.
    pub fn stop(&self) {
        self.inner.stop();
    }

    // ========== Queries ==========

    /// Effective role: the local role, or the role another window reported
    pub fn mode(&self) -> Role {
        self.inner.state.lock().merged_status().role
    }

    /// Effective identity: the local endpoint id, or the one another window
    /// reported
    pub fn peer_id(&self) -> Option<PeerId> {
        self.inner.state.lock().merged_status().peer_id
    }

    /// Mode and identity together
    pub fn status(&self) -> StatusSnapshot {
        self.inner.state.lock().merged_status()
    }

    /// Whether this process itself is hosting
    pub fn is_local_host(&self) -> bool {
        self.inner.state.lock().role == Role::Host
    }

    /// When any data message last arrived, from any origin
    pub fn last_data_received(&self) -> Option<Instant> {
        self.inner.state.lock().last_data_at
    }

    /// Remote identities with an open connection
    pub fn open_connections(&self) -> Vec<PeerId> {
        let transport = self.inner.state.lock().transport.clone();
        transport.map(|t| t.open_connections()).unwrap_or_default()
    }

    // ========== Snapshot updates (host only) ==========

    /// Replace the latest telemetry snapshot. Ignored unless hosting.
    pub fn update_telemetry(&self, record: TelemetryRecord) {
        let mut state = self.inner.state.lock();
        if state.role == Role::Host {
            state.telemetry = Some(record);
        }
    }

    /// Replace the latest session snapshot. Ignored unless hosting.
    pub fn update_session(&self, session: Value) {
        let mut state = self.inner.state.lock();
        if state.role == Role::Host {
            state.session = Some(session);
        }
    }

    /// Replace the fuel lap history. Ignored unless hosting.
    pub fn update_fuel_history(&self, history: Vec<FuelLap>) {
        let mut state = self.inner.state.lock();
        if state.role == Role::Host {
            state.fuel_history = Some(history);
        }
    }

    // ========== Sending ==========

    /// Send a message to every guest and sibling window right now.
    /// Ignored unless hosting.
    pub fn broadcast_manual(&self, message: SyncMessage) {
        self.inner.send_manual(Role::Host, message);
    }

    /// Send a message to the host and mirror it to the bridge.
    /// Ignored unless guest.
    pub fn send_to_host(&self, message: SyncMessage) {
        self.inner.send_manual(Role::Guest, message);
    }

    // ========== Subscriptions ==========

    /// Receive every incoming message, whatever its origin
    pub fn on_data(&self, callback: impl Fn(&DataEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.data_listeners.subscribe(callback)
    }

    /// Receive the current status immediately, then every change
    pub fn on_status_change(
        &self,
        callback: impl Fn(&StatusSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&self.status());
        self.inner.status_listeners.subscribe(callback)
    }

    /// Receive the identity of every newly opened connection
    pub fn on_peer_connected(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) -> Subscription {
        self.inner.peer_listeners.subscribe(callback)
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    /// Tear down the current session. Returns the previous local role and
    /// whether the remote status was reset.
    fn end_session(&self, reset_remote: bool) -> (Role, bool) {
        let (previous, remote_changed, transport, tasks) = {
            let mut state = self.state.lock();
            let previous = state.role;
            state.epoch += 1;
            state.role = Role::Idle;
            state.peer_id = None;
            state.forced_id = None;
            state.host_target = None;
            state.telemetry = None;
            state.session = None;
            state.fuel_history = None;
            state.last_session_sent = None;
            state.last_network_at = None;

            let remote_changed = reset_remote && state.remote != StatusSnapshot::idle();
            if reset_remote {
                state.remote = StatusSnapshot::idle();
            }
            (
                previous,
                remote_changed,
                state.transport.take(),
                std::mem::take(&mut state.session_tasks),
            )
        };

        for task in tasks {
            task.abort();
        }
        if let Some(transport) = transport {
            transport.close_all();
            transport.destroy();
        }
        (previous, remote_changed)
    }

    fn stop(&self) {
        let (previous, remote_changed) = self.end_session(true);
        if previous.is_active() {
            info!(%previous, "Sharing stopped");
            self.notify_status(true);
        } else if remote_changed {
            debug!("Cleared status reported by another window");
            self.notify_status(false);
        }
    }

    /// Tell listeners about the current status; with `echo`, also tell the
    /// other windows about the local status
    fn notify_status(&self, echo: bool) {
        let (status, local) = {
            let state = self.state.lock();
            (state.merged_status(), state.local_status())
        };
        debug!(%status, echo, "Status changed");

        if echo {
            if let Some(bridge) = &self.bridge {
                if let Err(e) = bridge.update_status(local.clone()) {
                    warn!(error = %e, "Failed to push status to bridge");
                }
            }
            if let Some(relay) = &self.relay {
                relay.publish(SyncMessage::Status(local));
            }
        }

        self.status_listeners.emit(&status);
    }

    fn adopt_remote_status(&self, mut status: StatusSnapshot) {
        if status.role == Role::Idle {
            status.peer_id = None;
        }
        {
            let mut state = self.state.lock();
            if state.remote == status {
                return;
            }
            debug!(%status, "Adopting status from another window");
            state.remote = status;
        }
        self.notify_status(false);
    }

    // ========== Transport events ==========

    fn handle_transport_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Opened(id) => self.on_opened(epoch, id),
            TransportEvent::ConnectionOpened(peer) => self.on_connection_opened(epoch, peer),
            TransportEvent::Data { from, message } => {
                self.handle_incoming(Origin::Network, Some(from), message)
            }
            TransportEvent::ConnectionClosed(peer) => {
                info!(remote = %peer.short(), "Peer disconnected");
            }
            TransportEvent::ConnectionError { peer, error } => {
                warn!(remote = %peer.short(), %error, "Connection failed");
            }
            TransportEvent::EndpointError(error) => {
                error!(%error, "Sharing endpoint failed, falling back to idle");
                self.stop();
            }
        }
    }

    fn on_opened(self: &Arc<Self>, epoch: u64, id: PeerId) {
        let (role, transport, host) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.peer_id = Some(id.clone());
            (state.role, state.transport.clone(), state.host_target.clone())
        };

        let weak = Arc::downgrade(self);
        let mut timers = Vec::new();
        match role {
            Role::Host => {
                timers.push(tokio::spawn(run_broadcast_cycle(
                    weak.clone(),
                    epoch,
                    self.config.telemetry_interval(),
                )));
                timers.push(tokio::spawn(run_keep_alive(
                    weak,
                    epoch,
                    self.config.keep_alive_interval(),
                )));
            }
            Role::Guest => {
                timers.push(tokio::spawn(run_keep_alive(
                    weak,
                    epoch,
                    self.config.keep_alive_interval(),
                )));
                if let (Some(transport), Some(host)) = (&transport, &host) {
                    transport.connect(host);
                }
            }
            Role::Idle => return,
        }

        {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                state.session_tasks.extend(timers);
            } else {
                for timer in timers {
                    timer.abort();
                }
                return;
            }
        }

        info!(peer_id = %id, %role, "Sharing endpoint open");
        self.notify_status(true);
    }

    fn on_connection_opened(&self, epoch: u64, peer: PeerId) {
        let (role, transport) = {
            let state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            (state.role, state.transport.clone())
        };
        let Some(transport) = transport else {
            return;
        };

        info!(remote = %peer.short(), %role, "Peer connected");
        match role {
            Role::Host => {
                for message in self.sync_payload() {
                    transport.send(&peer, &message);
                }
            }
            Role::Guest => {
                transport.send(&peer, &SyncMessage::RequestSync);
            }
            Role::Idle => {}
        }

        self.peer_listeners.emit(&peer);
    }

    // ========== Incoming data ==========

    fn handle_incoming(&self, origin: Origin, from: Option<PeerId>, message: SyncMessage) {
        let role = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.last_data_at = Some(now);
            if origin == Origin::Network {
                state.last_network_at = Some(now);
            }
            state.role
        };
        let kind = message.kind();
        trace!(%origin, %kind, "Incoming message");

        match &message {
            SyncMessage::RequestSync => self.answer_sync_request(origin, from.as_ref()),
            SyncMessage::Status(status) if origin == Origin::LocalBus => {
                self.adopt_remote_status(status.clone())
            }
            _ => {}
        }

        let targets = relay_targets(origin, kind, role, &self.config.relay);
        self.forward_to_siblings(targets, &message);
        if targets.subscribers {
            self.data_listeners.emit(&DataEvent::new(origin, from, message));
        }
    }

    /// Hand received data to sibling windows over exactly one fabric. A
    /// sibling listening on both must not see the message twice.
    fn forward_to_siblings(&self, targets: RelayTargets, message: &SyncMessage) {
        match (&self.bridge, &self.relay) {
            (Some(bridge), _) if targets.bridge => {
                if let Err(e) = bridge.broadcast_data(message.clone()) {
                    warn!(error = %e, kind = %message.kind(), "Failed to push data to bridge");
                }
            }
            (_, Some(relay)) if targets.local_bus => {
                relay.publish(message.clone());
            }
            _ => {}
        }
    }

    /// Full current state for a guest that just arrived or asked for it
    fn sync_payload(&self) -> Vec<SyncMessage> {
        let state = self.state.lock();
        let mut payload = Vec::with_capacity(2);
        if let Some(session) = &state.session {
            payload.push(SyncMessage::Session(self.normalizer.filter_session(session)));
        }
        if let Some(history) = &state.fuel_history {
            payload.push(SyncMessage::FuelHistory(history.clone()));
        }
        payload
    }

    fn answer_sync_request(&self, origin: Origin, from: Option<&PeerId>) {
        let (role, transport) = {
            let state = self.state.lock();
            (state.role, state.transport.clone())
        };
        if role != Role::Host {
            return;
        }

        let payload = self.sync_payload();
        if payload.is_empty() {
            debug!(%origin, "Sync requested but no snapshot to answer with");
            return;
        }

        match (origin, from, transport) {
            (Origin::Network, Some(peer), Some(transport)) => {
                debug!(remote = %peer.short(), "Answering sync request");
                for message in &payload {
                    transport.send(peer, message);
                }
            }
            (Origin::LocalBus | Origin::Bridge, _, _) => {
                if let Some(relay) = &self.relay {
                    debug!(%origin, "Answering sync request on local relay bus");
                    for message in payload {
                        relay.publish(message);
                    }
                }
            }
            _ => {}
        }
    }

    // ========== Outgoing data ==========

    fn send_own(&self, transport: &Arc<dyn PeerTransport>, role: Role, message: SyncMessage) {
        let targets = relay_targets(Origin::Own, message.kind(), role, &self.config.relay);
        if targets.network {
            let reached = transport.broadcast(&message);
            trace!(kind = %message.kind(), reached, "Broadcast");
        }
        if targets.local_bus {
            if let Some(relay) = &self.relay {
                relay.publish(message);
            }
        }
    }

    fn send_manual(&self, required: Role, message: SyncMessage) {
        let (role, transport) = {
            let state = self.state.lock();
            (state.role, state.transport.clone())
        };
        if role != required {
            debug!(%role, kind = %message.kind(), "Ignoring send outside of {}", required);
            return;
        }

        let targets = relay_targets(Origin::Manual, message.kind(), role, &self.config.relay);
        if targets.network {
            if let Some(transport) = &transport {
                transport.broadcast(&message);
            }
        }
        if targets.local_bus {
            if let Some(relay) = &self.relay {
                relay.publish(message.clone());
            }
        }
        if targets.bridge {
            if let Some(bridge) = &self.bridge {
                if let Err(e) = bridge.broadcast_data(message) {
                    warn!(error = %e, "Failed to push data to bridge");
                }
            }
        }
    }

    // ========== Timers ==========

    /// One broadcast-cycle tick. Returns false once the session is over.
    fn broadcast_tick(&self, epoch: u64) -> bool {
        let now = Instant::now();
        let (transport, telemetry, session) = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.role != Role::Host {
                return false;
            }
            let Some(transport) = state.transport.clone() else {
                return false;
            };

            let telemetry = state
                .telemetry
                .as_ref()
                .map(|record| self.normalizer.filter_telemetry(record));

            let session_due = state.session.is_some()
                && state
                    .last_session_sent
                    .map_or(true, |sent| now.duration_since(sent) >= self.config.session_interval());
            let session = if session_due {
                state.last_session_sent = Some(now);
                state
                    .session
                    .as_ref()
                    .map(|session| self.normalizer.filter_session(session))
            } else {
                None
            };
            (transport, telemetry, session)
        };

        if let Some(frame) = telemetry {
            self.send_own(&transport, Role::Host, SyncMessage::Telemetry(frame));
        }
        if let Some(frame) = session {
            self.send_own(&transport, Role::Host, SyncMessage::Session(frame));
        }
        true
    }

    /// One keep-alive tick. Returns false once the session is over.
    fn keep_alive_tick(&self, epoch: u64) -> bool {
        let now = Instant::now();
        let (role, transport, host, stale) = {
            let state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            let Some(transport) = state.transport.clone() else {
                return false;
            };
            let stale = state
                .last_network_at
                .map_or(true, |at| now.duration_since(at) >= self.config.resync_after());
            (state.role, transport, state.host_target.clone(), stale)
        };

        match role {
            Role::Host => {
                self.send_own(&transport, role, SyncMessage::keep_alive_now());
            }
            Role::Guest => {
                let Some(host) = host.filter(|_| stale) else {
                    return true;
                };
                if transport.open_connections().contains(&host) {
                    debug!(host = %host.short(), "No recent data from host, requesting sync");
                    transport.send(&host, &SyncMessage::RequestSync);
                } else if !transport.pending_connections().contains(&host) {
                    info!(host = %host.short(), "Host link lost, dialing again");
                    transport.connect(&host);
                }
            }
            Role::Idle => return false,
        }
        true
    }
}

async fn run_session(inner: Weak<Inner>, epoch: u64, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.is_current(epoch) {
            return;
        }
        inner.handle_transport_event(epoch, event);
    }
    debug!(epoch, "Transport event stream ended");
}

async fn run_broadcast_cycle(inner: Weak<Inner>, epoch: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.broadcast_tick(epoch) {
            return;
        }
    }
}

async fn run_keep_alive(inner: Weak<Inner>, epoch: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.keep_alive_tick(epoch) {
            return;
        }
    }
}

async fn run_relay_pump(inner: Weak<Inner>, mut relay: RelayReceiver) {
    while let Some(message) = relay.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_incoming(Origin::LocalBus, None, message);
    }
}

async fn run_bridge_pump(inner: Weak<Inner>, mut events: BridgeEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            BridgeEvent::StatusChanged(status) => inner.adopt_remote_status(status),
            BridgeEvent::Data(message) => inner.handle_incoming(Origin::Bridge, None, message),
        }
    }
}
