//! Application coordinator
//!
//! One coordinator is one node. It owns the registry, the connection
//! manager and the gossip state, and is the only consumer of the node's
//! event queue: every signaling message, connection callback, timer tick
//! and operator command is handled to completion before the next one.

use crate::config::NodeSettings;
use crate::connections::{ConnectionError, ConnectionManager, Outcome};
use crate::gossip::Gossip;
use crate::liveness::LivenessSupervisor;
use crate::registry::{PeerRegistry, PeerSummary};
use crate::sink::NotificationSink;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Instant;
use swarm_core::{ConnectionState, PeerId, SignalEnvelope, ValueUpdate};
use swarm_net::{
    event_channel, ChannelFrame, Command, Connector, Event, EventReceiver, EventSender,
    SignalingTransport, TransportError,
};
use thiserror::Error;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Signaling transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Coordinator stopped")]
    Stopped,
}

/// Sends commands to a running coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    peer_id: PeerId,
    events: EventSender,
}

impl CoordinatorHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Draw a new random local value
    pub fn regenerate(&self) -> Result<(), CoordinatorError> {
        self.command(Command::Regenerate)
    }

    /// Replace the local value
    pub fn set_value(&self, value: i64) -> Result<(), CoordinatorError> {
        self.command(Command::SetValue(value))
    }

    /// Withdraw, close every connection and end `run`
    pub fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.command(Command::Shutdown)
    }

    fn command(&self, command: Command) -> Result<(), CoordinatorError> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| CoordinatorError::Stopped)
    }
}

/// Node statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub known_peers: usize,
    pub connected_peers: usize,
    pub open_channels: usize,
    pub value_records: usize,
    pub local_value: Option<i64>,
    pub aggregate: Option<i64>,
}

/// A single swarm node
pub struct Coordinator {
    local: PeerId,
    transport: Box<dyn SignalingTransport>,
    connections: ConnectionManager,
    registry: PeerRegistry,
    liveness: LivenessSupervisor,
    gossip: Gossip,
    sink: Arc<dyn NotificationSink>,
    rng: StdRng,
    events_tx: EventSender,
    events_rx: EventReceiver,
    /// Peer list last reported to the sink
    published_peers: Vec<PeerSummary>,
    started: bool,
    stopped: bool,
}

impl Coordinator {
    pub fn new(
        local: PeerId,
        settings: NodeSettings,
        transport: Box<dyn SignalingTransport>,
        connector: Box<dyn Connector>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (events_tx, events_rx) = event_channel();
        let connections = ConnectionManager::new(
            local.clone(),
            connector,
            settings.connection.clone(),
            settings.max_buffered_candidates,
            events_tx.clone(),
        );
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            local,
            transport,
            connections,
            registry: PeerRegistry::new(),
            liveness: LivenessSupervisor::new(settings.heartbeat_interval, settings.peer_timeout),
            gossip: Gossip::new(settings.value_range),
            sink,
            rng,
            events_tx,
            events_rx,
            published_peers: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.local
    }

    /// Command handle for this node
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            peer_id: self.local.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Subscribe to signaling, announce presence and draw the first value
    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        if self.started {
            return Ok(());
        }
        self.transport
            .subscribe(&self.local, self.events_tx.clone())?;
        self.transport.announce_presence(&self.local)?;
        self.started = true;
        info!(
            "Node {} started on {} signaling",
            self.local,
            self.transport.name()
        );
        self.regenerate();
        Ok(())
    }

    /// Withdraw presence and close every connection. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.transport.withdraw_presence(&self.local) {
            warn!("Failed to withdraw presence of {}: {}", self.local, e);
        }
        let closed = self
            .connections
            .close_all(&mut self.registry, Instant::now());
        for peer in &closed {
            self.gossip.forget(peer);
        }
        self.flush_notifications();
        info!("Node {} stopped", self.local);
    }

    /// Handle every queued event; returns how many were handled
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Run until shutdown, heartbeating on the configured interval
    pub async fn run(mut self) -> Result<CoordinatorStats, CoordinatorError> {
        self.start()?;

        let period = self.liveness.interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopped {
            let event = tokio::select! {
                received = self.events_rx.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => Event::Tick,
            };
            self.handle_event(event);
        }

        self.stop();
        Ok(self.stats())
    }

    /// Handle one event
    pub fn handle_event(&mut self, event: Event) {
        self.handle_event_at(event, Instant::now());
    }

    /// Handle one event as if it happened at `now`
    pub fn handle_event_at(&mut self, event: Event, now: Instant) {
        if self.stopped {
            debug!("Node {} stopped, dropping {:?}", self.local, event);
            return;
        }
        match event {
            Event::Discovered { peer, handle } => self.on_discovered(peer, handle, now),
            Event::Alive(peer) => {
                if peer == self.local {
                    return;
                }
                if self.registry.touch(&peer, now) {
                    self.maybe_initiate(&peer, now);
                } else {
                    self.on_discovered(peer, None, now);
                }
            }
            Event::Departed(peer) => self.evict(&peer, "left the signaling channel", now),
            Event::Signal(envelope) => self.on_signal(envelope, now),
            Event::Connection { peer, link, event } => {
                let outcome =
                    self.connections
                        .on_connection_event(&mut self.registry, &peer, link, event, now);
                self.on_outcome(&peer, outcome, now);
            }
            Event::Tick => self.on_tick_at(now),
            Event::Command(Command::Regenerate) => self.regenerate(),
            Event::Command(Command::SetValue(value)) => self.set_local_value(value),
            Event::Command(Command::Shutdown) => self.stop(),
        }
        self.flush_notifications();
    }

    fn on_discovered(&mut self, peer: PeerId, handle: Option<String>, now: Instant) {
        if peer == self.local {
            return;
        }
        if self.registry.discover(&peer, handle, now) {
            info!("{} discovered {}", self.local, peer);
            if let Err(e) = self.transport.greet(&self.local, &peer) {
                warn!("Failed to greet {}: {}", peer, e);
            }
        }
        self.maybe_initiate(&peer, now);
    }

    /// Start a handshake if the tie-break makes us the initiator and no
    /// connection is in progress
    fn maybe_initiate(&mut self, peer: &PeerId, now: Instant) {
        if !self.local.initiates_to(peer) {
            return;
        }
        if !matches!(
            self.registry.state(peer),
            ConnectionState::Idle | ConnectionState::Closed
        ) {
            return;
        }
        if let Err(e) = self.connect(peer, true, now) {
            warn!("Failed to connect to {}: {}", peer, e);
        }
    }

    /// Create a connection toward `peer` in the given role
    pub fn connect(
        &mut self,
        peer: &PeerId,
        as_initiator: bool,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        self.connections
            .connect(&mut self.registry, peer, as_initiator, now)?;
        Ok(())
    }

    fn on_signal(&mut self, envelope: SignalEnvelope, now: Instant) {
        let peer = envelope.sender.clone();
        if peer == self.local {
            return;
        }
        let kind = envelope.kind();
        if !self.registry.touch(&peer, now) {
            debug!("Discarding {} from untracked peer {}", kind, peer);
            return;
        }
        match self
            .connections
            .handle_signal(&mut self.registry, envelope, now)
        {
            Ok(()) => {}
            Err(e @ ConnectionError::HandshakeFailure { .. }) => {
                warn!("{}", e);
                self.close_peer(&peer, now);
            }
            Err(e) => debug!("Discarding {} from {}: {}", kind, peer, e),
        }
    }

    fn on_outcome(&mut self, peer: &PeerId, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::None => {}
            Outcome::Publish(envelope) => {
                if let Err(e) = self.transport.publish(peer, &envelope) {
                    warn!("Failed to send {} to {}: {}", envelope.kind(), peer, e);
                }
            }
            Outcome::ChannelReady => {
                info!("Data channel to {} open", peer);
                if let Some(update) = self.gossip.local_update() {
                    self.send_value(peer, update);
                }
            }
            Outcome::Message(data) => {
                self.registry.touch(peer, now);
                self.on_channel_message(peer, &data, now);
            }
            Outcome::Closed(reason) => {
                info!("Connection to {} closed: {}", peer, reason);
                self.gossip.forget(peer);
            }
        }
    }

    fn on_channel_message(&mut self, peer: &PeerId, data: &[u8], now: Instant) {
        let update = match ChannelFrame::decode(data) {
            Ok(ChannelFrame::Value(update)) => update,
            Err(e) => {
                warn!("Discarding malformed frame from {}: {}", peer, e);
                return;
            }
        };
        let open = self.connections.is_open(peer);
        match self.gossip.on_value_received(peer, update, open, now) {
            Ok(()) => debug!("{} reports {} (seq {})", peer, update.value, update.seq),
            Err(e) => debug!("Ignoring value: {}", e),
        }
    }

    /// Heartbeat and evict silent peers
    pub fn on_tick_at(&mut self, now: Instant) {
        if let Err(e) = self.transport.heartbeat(&self.local) {
            warn!("Heartbeat of {} failed: {}", self.local, e);
        }
        for peer in self.liveness.expired(&self.registry, now) {
            self.evict(&peer, "timed out", now);
        }
    }

    /// Close the connection to `peer` and drop its value. Idempotent.
    pub fn close(&mut self, peer: &PeerId) {
        self.close_at(peer, Instant::now());
    }

    /// Close as if it happened at `now`
    pub fn close_at(&mut self, peer: &PeerId, now: Instant) {
        self.close_peer(peer, now);
        self.flush_notifications();
    }

    fn close_peer(&mut self, peer: &PeerId, now: Instant) {
        self.connections.close(&mut self.registry, peer, now);
        self.gossip.forget(peer);
    }

    fn evict(&mut self, peer: &PeerId, reason: &str, now: Instant) {
        self.close_peer(peer, now);
        if self.registry.remove(peer).is_some() {
            info!("{} evicted {}: {}", self.local, peer, reason);
        }
    }

    /// Draw a new local value and broadcast it
    pub fn regenerate(&mut self) {
        let update = self.gossip.generate(&mut self.rng);
        self.on_local_update(update);
    }

    /// Replace the local value and broadcast it
    pub fn set_local_value(&mut self, value: i64) {
        let update = self.gossip.set_local(value);
        self.on_local_update(update);
    }

    fn on_local_update(&mut self, update: ValueUpdate) {
        self.sink.on_local_value_changed(update.value);
        let frame = match ChannelFrame::Value(update).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode value update: {}", e);
                return;
            }
        };
        for peer in self.connections.open_channels() {
            self.send_frame(&peer, frame.clone());
        }
        self.flush_notifications();
    }

    fn send_value(&mut self, peer: &PeerId, update: ValueUpdate) {
        match ChannelFrame::Value(update).encode() {
            Ok(frame) => self.send_frame(peer, frame),
            Err(e) => warn!("Failed to encode value update: {}", e),
        }
    }

    /// Best effort: a channel that is not open is skipped
    fn send_frame(&mut self, peer: &PeerId, frame: Bytes) {
        if let Err(e) = self.connections.send(peer, frame) {
            debug!("Skipping {}: {}", peer, e);
        }
    }

    /// Report peer list and aggregate changes to the sink
    fn flush_notifications(&mut self) {
        let peers = self.registry.summaries();
        if peers != self.published_peers {
            self.sink.on_peer_list_changed(&peers);
            self.published_peers = peers;
        }
        if self.gossip.recompute() {
            self.sink.on_aggregate_changed(self.gossip.aggregate());
        }
    }

    pub fn local_value(&self) -> Option<i64> {
        self.gossip.local_value()
    }

    /// Maximum over the local value and every connected peer's value
    pub fn aggregate(&self) -> Option<i64> {
        self.gossip.aggregate()
    }

    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        self.registry.state(peer)
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.registry.summaries()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            known_peers: self.registry.len(),
            connected_peers: self.registry.count_in(ConnectionState::Connected),
            open_channels: self.connections.open_channels().len(),
            value_records: self.gossip.record_count(),
            local_value: self.gossip.local_value(),
            aggregate: self.gossip.aggregate(),
        }
    }
}
