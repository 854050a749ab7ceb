//! Peer registry
//!
//! Everything the node knows about each remote peer. Connection state is
//! written only by the connection manager; liveness timestamps and eviction
//! are driven by the liveness supervisor.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use swarm_core::{ConnectionState, PeerId};
use swarm_net::LinkId;

/// Known metadata for one remote peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Transport-specific display name (relay nick)
    pub display_handle: Option<String>,
    pub state: ConnectionState,
    /// Last liveness signal observed from this peer
    pub last_seen: Instant,
    /// Current connection object, if any
    pub link: Option<LinkId>,
}

/// Snapshot of a peer for notification sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub display_handle: Option<String>,
    pub state: ConnectionState,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(record: &PeerRecord) -> Self {
        Self {
            peer_id: record.peer_id.clone(),
            display_handle: record.display_handle.clone(),
            state: record.state,
        }
    }
}

/// Registry of remote peers, ordered by `PeerId`
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered peer and refresh its liveness.
    ///
    /// Returns true if the peer was not known before.
    pub fn discover(&mut self, peer: &PeerId, handle: Option<String>, now: Instant) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => {
                if handle.is_some() {
                    record.display_handle = handle;
                }
                record.last_seen = now;
                false
            }
            None => {
                self.peers.insert(
                    peer.clone(),
                    PeerRecord {
                        peer_id: peer.clone(),
                        display_handle: handle,
                        state: ConnectionState::Idle,
                        last_seen: now,
                        link: None,
                    },
                );
                true
            }
        }
    }

    /// Refresh liveness of a known peer; returns false if the peer is unknown
    pub fn touch(&mut self, peer: &PeerId, now: Instant) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Forget a peer entirely
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Connection state of a peer (`Idle` if unknown)
    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.peers
            .get(peer)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    /// Set connection state and handle of a known peer. Only discovery
    /// registers peers, so this returns false for an unknown one.
    pub(crate) fn set_state(
        &mut self,
        peer: &PeerId,
        state: ConnectionState,
        link: Option<LinkId>,
        now: Instant,
    ) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.state = state;
                record.link = link;
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Peers whose last liveness signal is older than `timeout`
    pub fn stale_peers(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|record| now.saturating_duration_since(record.last_seen) > timeout)
            .map(|record| record.peer_id.clone())
            .collect()
    }

    /// All peers, ordered by id
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers.values().map(PeerSummary::from).collect()
    }

    /// Peers currently in the given state
    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.peers.values().filter(|r| r.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
