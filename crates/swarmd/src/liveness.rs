//! Liveness supervisor
//!
//! A peer moves `Discovered -> Alive -> Evicted`: every liveness signal
//! refreshes its timestamp in the registry, and a peer silent for longer
//! than the timeout is evicted on the next tick. The local node heartbeats
//! on the same interval.

use crate::registry::PeerRegistry;
use std::time::{Duration, Instant};
use swarm_core::PeerId;

/// Heartbeat cadence and eviction window
#[derive(Debug, Clone, Copy)]
pub struct LivenessSupervisor {
    interval: Duration,
    timeout: Duration,
}

impl LivenessSupervisor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// How often the local node heartbeats
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence after which a peer is evicted
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Peers that must be evicted at `now`
    pub fn expired(&self, registry: &PeerRegistry, now: Instant) -> Vec<PeerId> {
        registry.stale_peers(now, self.timeout)
    }
}

impl Default for LivenessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(7))
    }
}
