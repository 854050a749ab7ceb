//! Reactor events
//!
//! Every input a node reacts to (signaling traffic, connection callbacks,
//! data-channel messages, timer ticks, operator commands) is one `Event`
//! on a single ordered queue.

use bytes::Bytes;
use swarm_core::{IceCandidate, PeerId, SessionDescription, SignalEnvelope};
use tokio::sync::mpsc;

/// Identifies one connection object. A fresh id is allocated every time a
/// connection toward a peer is created, so late callbacks from a closed
/// connection can be told apart from the current one.
pub type LinkId = u64;

/// Sending half of the event queue
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event queue
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create an event queue
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection state as reported by the connection primitive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection is unusable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

/// Callback from a connection object
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// A requested offer/answer was generated and applied locally
    LocalDescription(SessionDescription),
    /// A local candidate was gathered
    CandidateGenerated(IceCandidate),
    /// Connection state changed
    StateChanged(PeerConnectionState),
    /// Data channel (local or incoming) is open
    ChannelOpen,
    /// Bytes received on the data channel
    ChannelMessage(Bytes),
    /// Data channel closed
    ChannelClosed,
    /// A description or candidate was rejected
    NegotiationFailed(String),
}

/// Operator command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Draw a new random local value
    Regenerate,
    /// Publish a specific local value
    SetValue(i64),
    /// Withdraw, close everything and stop
    Shutdown,
}

/// Reactor input
#[derive(Clone, Debug)]
pub enum Event {
    /// Peer seen for the first time, or its display handle changed
    Discovered {
        peer: PeerId,
        handle: Option<String>,
    },
    /// Liveness signal from a known peer
    Alive(PeerId),
    /// Peer left the bootstrap channel
    Departed(PeerId),
    /// Signaling envelope addressed to us
    Signal(SignalEnvelope),
    /// Callback from a connection object
    Connection {
        peer: PeerId,
        link: LinkId,
        event: ConnectionEvent,
    },
    /// Heartbeat timer fired
    Tick,
    /// Operator command
    Command(Command),
}
