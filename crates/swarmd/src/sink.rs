//! Notification sinks
//!
//! The only user-visible surface of a node: peer list, local value and
//! aggregate updates.

use crate::registry::PeerSummary;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use swarm_core::PeerId;
use tracing::info;

/// Aggregates kept in [`SinkSnapshot::aggregate_history`]
pub const AGGREGATE_HISTORY_LIMIT: usize = 64;

/// Receiver of user-visible node updates
pub trait NotificationSink: Send + Sync {
    fn on_peer_list_changed(&self, peers: &[PeerSummary]);

    fn on_local_value_changed(&self, value: i64);

    /// `None` while the aggregate is undefined
    fn on_aggregate_changed(&self, aggregate: Option<i64>);
}

/// Latest state reported to a [`TracingSink`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub peers: Vec<PeerSummary>,
    pub local_value: Option<i64>,
    pub aggregate: Option<i64>,
    /// Most recent aggregates reported, oldest first
    pub aggregate_history: VecDeque<Option<i64>>,
}

/// Sink that logs every update and keeps the latest snapshot
#[derive(Clone)]
pub struct TracingSink {
    node: PeerId,
    state: Arc<Mutex<SinkSnapshot>>,
}

impl TracingSink {
    pub fn new(node: PeerId) -> Self {
        Self {
            node,
            state: Arc::new(Mutex::new(SinkSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        self.state.lock().clone()
    }

    pub fn aggregate(&self) -> Option<i64> {
        self.state.lock().aggregate
    }
}

impl NotificationSink for TracingSink {
    fn on_peer_list_changed(&self, peers: &[PeerSummary]) {
        let listing: Vec<String> = peers
            .iter()
            .map(|p| match &p.display_handle {
                Some(handle) => format!("{} ({}) {}", p.peer_id, handle, p.state),
                None => format!("{} {}", p.peer_id, p.state),
            })
            .collect();
        info!(node = %self.node, "Peers: [{}]", listing.join(", "));
        self.state.lock().peers = peers.to_vec();
    }

    fn on_local_value_changed(&self, value: i64) {
        info!(node = %self.node, "Local value: {}", value);
        self.state.lock().local_value = Some(value);
    }

    fn on_aggregate_changed(&self, aggregate: Option<i64>) {
        match aggregate {
            Some(value) => info!(node = %self.node, "Swarm maximum: {}", value),
            None => info!(node = %self.node, "Swarm maximum: undefined"),
        }
        let mut state = self.state.lock();
        state.aggregate = aggregate;
        if state.aggregate_history.len() >= AGGREGATE_HISTORY_LIMIT {
            state.aggregate_history.pop_front();
        }
        state.aggregate_history.push_back(aggregate);
    }
}
