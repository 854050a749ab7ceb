//! Gossip and aggregation
//!
//! Holds the local value, the last known value of every connected peer and
//! the derived swarm maximum. Only this module writes value records.

use rand::Rng;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Instant;
use swarm_core::{aggregate, PeerId, ValueUpdate};
use thiserror::Error;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Value from {0} without an open connection")]
    NotConnected(PeerId),
    #[error("Stale value from {peer}: seq {seq} <= {recorded}")]
    Stale {
        peer: PeerId,
        seq: u64,
        recorded: u64,
    },
}

/// Last value received from one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub peer_id: PeerId,
    pub seq: u64,
    pub value: i64,
    pub received_at: Instant,
}

/// Local value, peer values and their maximum
#[derive(Debug)]
pub struct Gossip {
    range: RangeInclusive<i64>,
    local: Option<ValueUpdate>,
    seq: u64,
    peers: HashMap<PeerId, ValueRecord>,
    aggregate: Option<i64>,
}

impl Gossip {
    pub fn new(range: RangeInclusive<i64>) -> Self {
        Self {
            range,
            local: None,
            seq: 0,
            peers: HashMap::new(),
            aggregate: None,
        }
    }

    /// Draw a new local value uniformly from the configured range
    pub fn generate<R: Rng>(&mut self, rng: &mut R) -> ValueUpdate {
        let value = rng.gen_range(self.range.clone());
        self.set_local(value)
    }

    /// Replace the local value; every call gets a fresh sequence number
    pub fn set_local(&mut self, value: i64) -> ValueUpdate {
        self.seq += 1;
        let update = ValueUpdate {
            seq: self.seq,
            value,
        };
        self.local = Some(update);
        update
    }

    /// Current local value with its sequence number
    pub fn local_update(&self) -> Option<ValueUpdate> {
        self.local
    }

    pub fn local_value(&self) -> Option<i64> {
        self.local.map(|update| update.value)
    }

    /// Record a value announced by `peer`.
    ///
    /// Only peers with an open channel count. Updates older than the one
    /// already recorded are rejected so reordering cannot regress a peer.
    pub fn on_value_received(
        &mut self,
        peer: &PeerId,
        update: ValueUpdate,
        channel_open: bool,
        now: Instant,
    ) -> Result<(), GossipError> {
        if !channel_open {
            return Err(GossipError::NotConnected(peer.clone()));
        }
        if let Some(record) = self.peers.get(peer) {
            if update.seq <= record.seq {
                return Err(GossipError::Stale {
                    peer: peer.clone(),
                    seq: update.seq,
                    recorded: record.seq,
                });
            }
        }
        self.peers.insert(
            peer.clone(),
            ValueRecord {
                peer_id: peer.clone(),
                seq: update.seq,
                value: update.value,
                received_at: now,
            },
        );
        Ok(())
    }

    /// Drop the value of a peer; returns true if one was recorded
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Recompute the aggregate; returns true if it changed
    pub fn recompute(&mut self) -> bool {
        let next = aggregate(
            self.local_value(),
            self.peers.values().map(|record| record.value),
        );
        let changed = next != self.aggregate;
        self.aggregate = next;
        changed
    }

    /// Last computed aggregate; `None` until the local value exists
    pub fn aggregate(&self) -> Option<i64> {
        self.aggregate
    }

    pub fn record(&self, peer: &PeerId) -> Option<&ValueRecord> {
        self.peers.get(peer)
    }

    /// Number of peers with a recorded value
    pub fn record_count(&self) -> usize {
        self.peers.len()
    }
}
