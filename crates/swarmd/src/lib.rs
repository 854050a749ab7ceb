//! swarmd - peer swarm node
//!
//! This crate provides:
//! - Peer registry and liveness supervision
//! - The offer/answer/candidate handshake state machine
//! - Max-value gossip over data channels
//! - A single-actor coordinator wiring it all to a signaling transport

pub mod config;
pub mod connections;
pub mod coordinator;
pub mod gossip;
pub mod liveness;
pub mod registry;
pub mod sink;

pub use config::{Backend, Config, NodeSettings};
pub use connections::{ConnectionError, ConnectionManager};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorHandle, CoordinatorStats};
pub use gossip::{Gossip, GossipError};
pub use liveness::LivenessSupervisor;
pub use registry::{PeerRecord, PeerRegistry, PeerSummary};
pub use sink::{NotificationSink, SinkSnapshot, TracingSink};
