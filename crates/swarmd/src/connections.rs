//! Connection manager
//!
//! Drives exactly one handshake per remote peer and owns the resulting data
//! channel. Calls into the connection primitive are fire-and-forget; their
//! results come back as [`ConnectionEvent`]s that the coordinator hands to
//! [`ConnectionManager::on_connection_event`]. Only this module writes
//! connection state into the [`PeerRegistry`].

use crate::registry::PeerRegistry;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use swarm_core::{
    ConnectionState, IceCandidate, PeerId, Role, SdpType, SessionDescription, Signal,
    SignalEnvelope,
};
use swarm_net::{
    ConnectionConfig, ConnectionEvent, Connector, EventSender, LinkError, LinkId,
    PeerConnection, PeerConnectionState,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Already connecting to {0}")]
    AlreadyConnecting(PeerId),
    #[error("Already connected to {0}")]
    AlreadyConnected(PeerId),
    #[error("No connection to {0}")]
    NoSuchConnection(PeerId),
    #[error("Peer {0} has not been discovered")]
    UnknownPeer(PeerId),
    #[error("Stale {kind} from {peer}")]
    StaleSignal { peer: PeerId, kind: String },
    #[error("Handshake with {peer} failed: {reason}")]
    HandshakeFailure { peer: PeerId, reason: String },
    #[error("Data channel error: {0}")]
    Channel(#[from] LinkError),
}

/// What the coordinator must do after a connection callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do
    None,
    /// Send this envelope to the peer over the signaling transport
    Publish(SignalEnvelope),
    /// Connection is up and the data channel open
    ChannelReady,
    /// Bytes received on the data channel
    Message(Bytes),
    /// The connection ended and was released
    Closed(String),
}

struct PeerLink {
    id: LinkId,
    role: Role,
    conn: Box<dyn PeerConnection>,
    connected: bool,
    channel_open: bool,
    /// Remote description handed to the connection object
    remote_applied: bool,
    /// Candidates waiting for the remote description
    pending: VecDeque<IceCandidate>,
}

impl PeerLink {
    fn is_open(&self) -> bool {
        self.connected && self.channel_open
    }

    fn flush_pending(&mut self) {
        for candidate in self.pending.drain(..) {
            self.conn.add_candidate(candidate);
        }
    }
}

/// Push onto a bounded candidate buffer, dropping the oldest entry when full
fn buffer_candidate(
    buffer: &mut VecDeque<IceCandidate>,
    candidate: IceCandidate,
    max: usize,
    peer: &PeerId,
) {
    if buffer.len() >= max {
        warn!(
            "Candidate buffer for {} full ({}), dropping oldest candidate",
            peer, max
        );
        buffer.pop_front();
    }
    buffer.push_back(candidate);
}

/// Owner of all connection objects of one node
pub struct ConnectionManager {
    local: PeerId,
    connector: Box<dyn Connector>,
    config: ConnectionConfig,
    events: EventSender,
    links: HashMap<PeerId, PeerLink>,
    /// Candidates from peers we have no connection object for yet
    early_candidates: HashMap<PeerId, VecDeque<IceCandidate>>,
    max_buffered: usize,
    next_link: LinkId,
}

impl ConnectionManager {
    pub fn new(
        local: PeerId,
        connector: Box<dyn Connector>,
        config: ConnectionConfig,
        max_buffered: usize,
        events: EventSender,
    ) -> Self {
        Self {
            local,
            connector,
            config,
            events,
            links: HashMap::new(),
            early_candidates: HashMap::new(),
            max_buffered: max_buffered.max(1),
            next_link: 1,
        }
    }

    /// Create a connection object toward `peer`.
    ///
    /// As initiator this opens the local data channel and starts the offer;
    /// the offer itself is published once the primitive reports it. As
    /// responder the object waits for an incoming offer.
    pub fn connect(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        as_initiator: bool,
        now: Instant,
    ) -> Result<LinkId, ConnectionError> {
        if !registry.contains(peer) {
            return Err(ConnectionError::UnknownPeer(peer.clone()));
        }
        match registry.state(peer) {
            ConnectionState::Connecting(_) => {
                return Err(ConnectionError::AlreadyConnecting(peer.clone()))
            }
            ConnectionState::Connected => {
                return Err(ConnectionError::AlreadyConnected(peer.clone()))
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }
        if let Some(mut leftover) = self.links.remove(peer) {
            leftover.conn.close();
        }

        let link = self.next_link;
        self.next_link += 1;
        let mut conn = self
            .connector
            .create(&self.local, peer, link, &self.config, self.events.clone())
            .map_err(|e| ConnectionError::HandshakeFailure {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;

        let role = if as_initiator {
            conn.create_data_channel(&self.config.channel_label);
            conn.create_offer();
            Role::Initiator
        } else {
            Role::Responder
        };

        let pending = self.early_candidates.remove(peer).unwrap_or_default();
        self.links.insert(
            peer.clone(),
            PeerLink {
                id: link,
                role,
                conn,
                connected: false,
                channel_open: false,
                remote_applied: false,
                pending,
            },
        );
        registry.set_state(peer, ConnectionState::Connecting(role), Some(link), now);
        info!("Connecting to {} as {} (link {})", peer, role, link);
        Ok(link)
    }

    /// Apply an inbound signaling envelope
    pub fn handle_signal(
        &mut self,
        registry: &mut PeerRegistry,
        envelope: SignalEnvelope,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let peer = envelope.sender;
        if !registry.contains(&peer) {
            return Err(ConnectionError::StaleSignal {
                kind: envelope.signal.kind().to_string(),
                peer,
            });
        }
        match envelope.signal {
            Signal::Offer(desc) => self.handle_offer(registry, &peer, desc, now),
            Signal::Answer(desc) => self.handle_answer(&peer, desc),
            Signal::Candidate(candidate) => {
                self.handle_candidate(registry, &peer, candidate);
                Ok(())
            }
        }
    }

    fn handle_offer(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        desc: SessionDescription,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let stale = || ConnectionError::StaleSignal {
            peer: peer.clone(),
            kind: "offer".into(),
        };

        match registry.state(peer) {
            ConnectionState::Connected => return Err(stale()),
            ConnectionState::Connecting(Role::Initiator) => {
                if self.local.initiates_to(peer) {
                    debug!("Ignoring offer from {}: we are the initiator", peer);
                    return Ok(());
                }
                info!("Yielding to offer from {}: it is the initiator", peer);
                // candidates for this offer may already wait on our own link
                let carried = self
                    .links
                    .get_mut(peer)
                    .map(|link| std::mem::take(&mut link.pending))
                    .unwrap_or_default();
                self.close(registry, peer, now);
                self.connect(registry, peer, false, now)?;
                if let Some(link) = self.links.get_mut(peer) {
                    link.pending = carried;
                }
            }
            ConnectionState::Connecting(Role::Responder) => {
                let waiting = self
                    .links
                    .get(peer)
                    .map(|link| !link.remote_applied)
                    .unwrap_or(false);
                if !waiting {
                    return Err(stale());
                }
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                self.connect(registry, peer, false, now)?;
            }
        }

        let link = self
            .links
            .get_mut(peer)
            .ok_or_else(|| ConnectionError::NoSuchConnection(peer.clone()))?;
        link.conn.set_remote_description(desc);
        link.remote_applied = true;
        link.conn.create_answer();
        link.flush_pending();
        Ok(())
    }

    fn handle_answer(
        &mut self,
        peer: &PeerId,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let link = self
            .links
            .get_mut(peer)
            .ok_or_else(|| ConnectionError::NoSuchConnection(peer.clone()))?;
        if link.role != Role::Initiator || link.remote_applied {
            return Err(ConnectionError::StaleSignal {
                peer: peer.clone(),
                kind: "answer".into(),
            });
        }
        link.conn.set_remote_description(desc);
        link.remote_applied = true;
        link.flush_pending();
        Ok(())
    }

    fn handle_candidate(
        &mut self,
        registry: &PeerRegistry,
        peer: &PeerId,
        candidate: IceCandidate,
    ) {
        match self.links.get_mut(peer) {
            Some(link) if link.remote_applied => link.conn.add_candidate(candidate),
            Some(link) => {
                buffer_candidate(&mut link.pending, candidate, self.max_buffered, peer)
            }
            // left over from a session that was already closed
            None if registry.state(peer) == ConnectionState::Closed => {
                debug!("Dropping candidate from {}: connection closed", peer);
            }
            None => {
                debug!("Buffering early candidate from {}", peer);
                let buffer = self.early_candidates.entry(peer.clone()).or_default();
                buffer_candidate(buffer, candidate, self.max_buffered, peer);
            }
        }
    }

    /// Process a callback from the connection object `link` toward `peer`
    pub fn on_connection_event(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        link: LinkId,
        event: ConnectionEvent,
        now: Instant,
    ) -> Outcome {
        let current = match self.links.get_mut(peer) {
            Some(current) if current.id == link => current,
            _ => {
                debug!("Discarding callback from stale link {} to {}", link, peer);
                return Outcome::None;
            }
        };

        match event {
            ConnectionEvent::LocalDescription(desc) => {
                let signal = match desc.sdp_type {
                    SdpType::Offer => Signal::Offer(desc),
                    SdpType::Answer => Signal::Answer(desc),
                };
                Outcome::Publish(SignalEnvelope::new(self.local.clone(), signal))
            }
            ConnectionEvent::CandidateGenerated(candidate) => Outcome::Publish(
                SignalEnvelope::new(self.local.clone(), Signal::Candidate(candidate)),
            ),
            ConnectionEvent::StateChanged(PeerConnectionState::Connected) => {
                let was_open = current.is_open();
                current.connected = true;
                registry.set_state(peer, ConnectionState::Connected, Some(link), now);
                info!("Connected to {} (link {})", peer, link);
                if !was_open && current.is_open() {
                    Outcome::ChannelReady
                } else {
                    Outcome::None
                }
            }
            ConnectionEvent::StateChanged(state) if state.is_terminal() => {
                self.close(registry, peer, now);
                Outcome::Closed(format!("connection {:?}", state))
            }
            ConnectionEvent::StateChanged(_) => Outcome::None,
            ConnectionEvent::ChannelOpen => {
                let was_open = current.is_open();
                current.channel_open = true;
                if !was_open && current.is_open() {
                    Outcome::ChannelReady
                } else {
                    Outcome::None
                }
            }
            ConnectionEvent::ChannelMessage(data) => Outcome::Message(data),
            ConnectionEvent::ChannelClosed => {
                self.close(registry, peer, now);
                Outcome::Closed("data channel closed".into())
            }
            ConnectionEvent::NegotiationFailed(reason) => {
                let failure = ConnectionError::HandshakeFailure {
                    peer: peer.clone(),
                    reason,
                };
                warn!("{}", failure);
                self.close(registry, peer, now);
                Outcome::Closed(failure.to_string())
            }
        }
    }

    /// Release the connection to `peer`. Safe to call in any state and
    /// any number of times; returns true if a connection was released.
    pub fn close(&mut self, registry: &mut PeerRegistry, peer: &PeerId, now: Instant) -> bool {
        self.early_candidates.remove(peer);
        let released = match self.links.remove(peer) {
            Some(mut link) => {
                link.conn.close();
                info!("Closed connection to {} (link {})", peer, link.id);
                true
            }
            None => false,
        };
        if registry.contains(peer) && (released || registry.state(peer).is_active()) {
            registry.set_state(peer, ConnectionState::Closed, None, now);
        }
        released
    }

    /// Close every connection; returns the peers that had one
    pub fn close_all(&mut self, registry: &mut PeerRegistry, now: Instant) -> Vec<PeerId> {
        self.early_candidates.clear();
        let mut peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.sort();
        for peer in &peers {
            self.close(registry, peer, now);
        }
        peers
    }

    /// Send bytes on the data channel to `peer`
    pub fn send(&mut self, peer: &PeerId, data: Bytes) -> Result<(), ConnectionError> {
        let link = self
            .links
            .get_mut(peer)
            .ok_or_else(|| ConnectionError::NoSuchConnection(peer.clone()))?;
        if !link.is_open() {
            return Err(LinkError::NotOpen.into());
        }
        link.conn.send(data)?;
        Ok(())
    }

    /// Whether `peer` has a connected link with an open data channel
    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.links.get(peer).map(PeerLink::is_open).unwrap_or(false)
    }

    /// Peers with an open data channel
    pub fn open_channels(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_open())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Current link id toward `peer`
    pub fn link_id(&self, peer: &PeerId) -> Option<LinkId> {
        self.links.get(peer).map(|link| link.id)
    }

    /// Number of live connection objects
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Candidates buffered for a peer we have no connection object for
    pub fn early_candidate_count(&self, peer: &PeerId) -> usize {
        self.early_candidates.get(peer).map(VecDeque::len).unwrap_or(0)
    }

    /// Peers with candidates waiting for a connection object
    pub fn early_candidate_peers(&self) -> usize {
        self.early_candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use swarm_net::event_channel;

    /// Call recorded by [`RecordingConnector`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(LinkId),
        DataChannel(String),
        Offer,
        Answer,
        Remote(SdpType),
        Candidate(String),
        Send(Bytes),
        Close,
    }

    /// Connection primitive that only records what it was asked to do
    #[derive(Clone, Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<(PeerId, LinkId, Call)>>>,
    }

    impl RecordingConnector {
        fn take(&self) -> Vec<Call> {
            self.calls.lock().drain(..).map(|(_, _, call)| call).collect()
        }
    }

    struct RecordingConnection {
        remote: PeerId,
        link: LinkId,
        calls: Arc<Mutex<Vec<(PeerId, LinkId, Call)>>>,
    }

    impl RecordingConnection {
        fn record(&self, call: Call) {
            self.calls.lock().push((self.remote.clone(), self.link, call));
        }
    }

    impl Connector for RecordingConnector {
        fn create(
            &self,
            _local: &PeerId,
            remote: &PeerId,
            link: LinkId,
            _config: &ConnectionConfig,
            _events: EventSender,
        ) -> Result<Box<dyn PeerConnection>, LinkError> {
            self.calls
                .lock()
                .push((remote.clone(), link, Call::Create(link)));
            Ok(Box::new(RecordingConnection {
                remote: remote.clone(),
                link,
                calls: self.calls.clone(),
            }))
        }
    }

    impl PeerConnection for RecordingConnection {
        fn create_data_channel(&mut self, label: &str) {
            self.record(Call::DataChannel(label.to_string()));
        }
        fn create_offer(&mut self) {
            self.record(Call::Offer);
        }
        fn create_answer(&mut self) {
            self.record(Call::Answer);
        }
        fn set_remote_description(&mut self, desc: SessionDescription) {
            self.record(Call::Remote(desc.sdp_type));
        }
        fn add_candidate(&mut self, candidate: IceCandidate) {
            self.record(Call::Candidate(candidate.candidate));
        }
        fn send(&mut self, data: Bytes) -> Result<(), LinkError> {
            self.record(Call::Send(data));
            Ok(())
        }
        fn close(&mut self) {
            self.record(Call::Close);
        }
    }

    fn manager(local: &str, max_buffered: usize) -> (ConnectionManager, RecordingConnector) {
        let connector = RecordingConnector::default();
        let (tx, _rx) = event_channel();
        let manager = ConnectionManager::new(
            PeerId::from(local),
            Box::new(connector.clone()),
            ConnectionConfig::default(),
            max_buffered,
            tx,
        );
        (manager, connector)
    }

    fn offer_from(peer: &PeerId) -> SignalEnvelope {
        SignalEnvelope::new(peer.clone(), Signal::Offer(SessionDescription::offer("o")))
    }

    fn candidate_from(peer: &PeerId, text: &str) -> SignalEnvelope {
        SignalEnvelope::new(peer.clone(), Signal::Candidate(IceCandidate::new(text)))
    }

    #[test]
    fn test_initiator_connect() {
        let (mut manager, connector) = manager("peer-a", 8);
        let mut registry = PeerRegistry::new();
        let b = PeerId::from("peer-b");
        let now = Instant::now();
        registry.discover(&b, None, now);

        let link = manager.connect(&mut registry, &b, true, now).unwrap();
        assert_eq!(
            connector.take(),
            vec![
                Call::Create(link),
                Call::DataChannel("swarm".into()),
                Call::Offer
            ]
        );
        assert_eq!(
            registry.state(&b),
            ConnectionState::Connecting(Role::Initiator)
        );

        assert!(matches!(
            manager.connect(&mut registry, &b, true, now),
            Err(ConnectionError::AlreadyConnecting(_))
        ));
        assert!(connector.take().is_empty());
    }

    #[test]
    fn test_offer_is_answered_once() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        assert_eq!(
            connector.take(),
            vec![Call::Create(1), Call::Remote(SdpType::Offer), Call::Answer]
        );
        assert_eq!(
            registry.state(&a),
            ConnectionState::Connecting(Role::Responder)
        );

        assert!(matches!(
            manager.handle_signal(&mut registry, offer_from(&a), now),
            Err(ConnectionError::StaleSignal { .. })
        ));
        assert!(connector.take().is_empty());
    }

    #[test]
    fn test_tie_break_winner_ignores_offer() {
        let (mut manager, connector) = manager("peer-a", 8);
        let mut registry = PeerRegistry::new();
        let b = PeerId::from("peer-b");
        let now = Instant::now();
        registry.discover(&b, None, now);

        let link = manager.connect(&mut registry, &b, true, now).unwrap();
        connector.take();

        manager
            .handle_signal(&mut registry, offer_from(&b), now)
            .unwrap();
        assert!(connector.take().is_empty());
        assert_eq!(manager.link_id(&b), Some(link));
        assert_eq!(
            registry.state(&b),
            ConnectionState::Connecting(Role::Initiator)
        );
    }

    #[test]
    fn test_tie_break_loser_yields() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);

        let first = manager.connect(&mut registry, &a, true, now).unwrap();
        connector.take();

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        let second = manager.link_id(&a).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            connector.take(),
            vec![
                Call::Close,
                Call::Create(second),
                Call::Remote(SdpType::Offer),
                Call::Answer
            ]
        );
        assert_eq!(
            registry.state(&a),
            ConnectionState::Connecting(Role::Responder)
        );
    }

    #[test]
    fn test_yield_keeps_candidates_for_remote_offer() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);

        manager.connect(&mut registry, &a, true, now).unwrap();
        manager
            .handle_signal(&mut registry, candidate_from(&a, "candidate:a1"), now)
            .unwrap();
        connector.take();

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        let second = manager.link_id(&a).unwrap();
        assert_eq!(
            connector.take(),
            vec![
                Call::Close,
                Call::Create(second),
                Call::Remote(SdpType::Offer),
                Call::Answer,
                Call::Candidate("candidate:a1".into()),
            ]
        );
    }

    #[test]
    fn test_signals_from_unknown_peers_are_stale() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();

        assert!(matches!(
            manager.handle_signal(&mut registry, offer_from(&a), now),
            Err(ConnectionError::StaleSignal { .. })
        ));
        for i in 0..50 {
            let gone = PeerId::from(format!("peer-gone-{}", i).as_str());
            assert!(manager
                .handle_signal(&mut registry, candidate_from(&gone, "candidate:late"), now)
                .is_err());
        }
        assert!(matches!(
            manager.connect(&mut registry, &a, true, now),
            Err(ConnectionError::UnknownPeer(_))
        ));

        assert!(registry.is_empty());
        assert_eq!(manager.link_count(), 0);
        assert_eq!(manager.early_candidate_peers(), 0);
        assert!(connector.take().is_empty());
    }

    #[test]
    fn test_candidates_from_closed_session_are_dropped() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        assert!(manager.close(&mut registry, &a, now));
        manager
            .handle_signal(&mut registry, candidate_from(&a, "candidate:old-session"), now)
            .unwrap();
        assert_eq!(manager.early_candidate_count(&a), 0);
        connector.take();

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        let link = manager.link_id(&a).unwrap();
        assert_eq!(
            connector.take(),
            vec![Call::Create(link), Call::Remote(SdpType::Offer), Call::Answer]
        );
    }

    #[test]
    fn test_close_all() {
        let (mut manager, connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let now = Instant::now();
        let a = PeerId::from("peer-a");
        let c = PeerId::from("peer-c");
        let idle = PeerId::from("peer-d");
        for peer in [&a, &c, &idle] {
            registry.discover(peer, None, now);
        }
        manager.connect(&mut registry, &c, true, now).unwrap();
        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        manager
            .handle_signal(&mut registry, candidate_from(&idle, "candidate:1"), now)
            .unwrap();
        connector.take();

        assert_eq!(manager.close_all(&mut registry, now), vec![a.clone(), c.clone()]);
        assert_eq!(manager.link_count(), 0);
        assert_eq!(manager.early_candidate_peers(), 0);
        assert_eq!(connector.take(), vec![Call::Close, Call::Close]);
        assert_eq!(registry.state(&a), ConnectionState::Closed);
        assert_eq!(registry.state(&c), ConnectionState::Closed);
        assert_eq!(registry.state(&idle), ConnectionState::Idle);
    }

    #[test]
    fn test_early_candidates_flushed_after_offer() {
        let (mut manager, connector) = manager("peer-b", 2);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);

        for text in ["candidate:1", "candidate:2", "candidate:3"] {
            manager
                .handle_signal(&mut registry, candidate_from(&a, text), now)
                .unwrap();
        }
        assert_eq!(manager.early_candidate_count(&a), 2);
        assert!(connector.take().is_empty());

        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        assert_eq!(
            connector.take(),
            vec![
                Call::Create(1),
                Call::Remote(SdpType::Offer),
                Call::Answer,
                Call::Candidate("candidate:2".into()),
                Call::Candidate("candidate:3".into()),
            ]
        );
        assert_eq!(manager.early_candidate_count(&a), 0);

        // once the remote description is applied candidates go straight through
        manager
            .handle_signal(&mut registry, candidate_from(&a, "candidate:4"), now)
            .unwrap();
        assert_eq!(connector.take(), vec![Call::Candidate("candidate:4".into())]);
    }

    #[test]
    fn test_answer_validation() {
        let (mut manager, connector) = manager("peer-a", 8);
        let mut registry = PeerRegistry::new();
        let b = PeerId::from("peer-b");
        let now = Instant::now();
        registry.discover(&b, None, now);
        let answer = SignalEnvelope::new(
            b.clone(),
            Signal::Answer(SessionDescription::answer("a")),
        );

        assert!(matches!(
            manager.handle_signal(&mut registry, answer.clone(), now),
            Err(ConnectionError::NoSuchConnection(_))
        ));

        manager.connect(&mut registry, &b, true, now).unwrap();
        // candidate before the answer waits on the link
        manager
            .handle_signal(&mut registry, candidate_from(&b, "candidate:9"), now)
            .unwrap();
        connector.take();

        manager
            .handle_signal(&mut registry, answer.clone(), now)
            .unwrap();
        assert_eq!(
            connector.take(),
            vec![
                Call::Remote(SdpType::Answer),
                Call::Candidate("candidate:9".into())
            ]
        );

        assert!(matches!(
            manager.handle_signal(&mut registry, answer, now),
            Err(ConnectionError::StaleSignal { .. })
        ));
    }

    #[test]
    fn test_connection_events() {
        let (mut manager, connector) = manager("peer-a", 8);
        let mut registry = PeerRegistry::new();
        let b = PeerId::from("peer-b");
        let now = Instant::now();
        registry.discover(&b, None, now);
        let link = manager.connect(&mut registry, &b, true, now).unwrap();

        let outcome = manager.on_connection_event(
            &mut registry,
            &b,
            link,
            ConnectionEvent::LocalDescription(SessionDescription::offer("o")),
            now,
        );
        assert!(matches!(
            outcome,
            Outcome::Publish(SignalEnvelope { signal: Signal::Offer(_), .. })
        ));

        // stale link ids are ignored
        assert_eq!(
            manager.on_connection_event(
                &mut registry,
                &b,
                link + 100,
                ConnectionEvent::ChannelOpen,
                now
            ),
            Outcome::None
        );

        assert_eq!(
            manager.on_connection_event(
                &mut registry,
                &b,
                link,
                ConnectionEvent::StateChanged(PeerConnectionState::Connected),
                now
            ),
            Outcome::None
        );
        assert_eq!(registry.state(&b), ConnectionState::Connected);
        assert!(!manager.is_open(&b));

        assert_eq!(
            manager.on_connection_event(&mut registry, &b, link, ConnectionEvent::ChannelOpen, now),
            Outcome::ChannelReady
        );
        assert_eq!(manager.open_channels(), vec![b.clone()]);

        connector.take();
        manager.send(&b, Bytes::from_static(b"42")).unwrap();
        assert_eq!(connector.take(), vec![Call::Send(Bytes::from_static(b"42"))]);

        let outcome = manager.on_connection_event(
            &mut registry,
            &b,
            link,
            ConnectionEvent::StateChanged(PeerConnectionState::Failed),
            now,
        );
        assert!(matches!(outcome, Outcome::Closed(_)));
        assert_eq!(registry.state(&b), ConnectionState::Closed);
        assert_eq!(manager.link_count(), 0);
        assert!(matches!(
            manager.send(&b, Bytes::from_static(b"x")),
            Err(ConnectionError::NoSuchConnection(_))
        ));
    }

    #[test]
    fn test_negotiation_failure_closes() {
        let (mut manager, _connector) = manager("peer-b", 8);
        let mut registry = PeerRegistry::new();
        let a = PeerId::from("peer-a");
        let now = Instant::now();
        registry.discover(&a, None, now);
        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        let link = manager.link_id(&a).unwrap();

        let outcome = manager.on_connection_event(
            &mut registry,
            &a,
            link,
            ConnectionEvent::NegotiationFailed("bad sdp".into()),
            now,
        );
        assert!(matches!(outcome, Outcome::Closed(reason) if reason.contains("bad sdp")));
        assert_eq!(registry.state(&a), ConnectionState::Closed);

        // closed peers accept a fresh offer
        manager
            .handle_signal(&mut registry, offer_from(&a), now)
            .unwrap();
        assert_eq!(
            registry.state(&a),
            ConnectionState::Connecting(Role::Responder)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut manager, connector) = manager("peer-a", 8);
        let mut registry = PeerRegistry::new();
        let b = PeerId::from("peer-b");
        let never = PeerId::from("peer-z");
        let now = Instant::now();
        registry.discover(&b, None, now);
        manager.connect(&mut registry, &b, true, now).unwrap();
        connector.take();

        assert!(manager.close(&mut registry, &b, now));
        let after_once = registry.summaries();
        assert!(!manager.close(&mut registry, &b, now));
        assert_eq!(registry.summaries(), after_once);
        assert_eq!(connector.take(), vec![Call::Close]);

        assert!(!manager.close(&mut registry, &never, now));
        assert!(!registry.contains(&never));
    }
}
