//! Core swarm types
//!
//! Identity, per-peer connection state, session descriptions, and the
//! signaling envelope exchanged over the bootstrap channel. Everything here
//! is plain data; behaviour lives in `swarmd`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// IDENTITY
// =============================================================================

/// Peer identifier, generated locally at startup.
///
/// Ordering is lexicographic on the underlying string. The ordering decides
/// who opens a connection: for any two distinct peers the lower id initiates,
/// the higher id answers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Prefix of generated identifiers
    pub const PREFIX: &'static str = "peer-";

    /// Generate a fresh random identifier (`peer-` + 12 hex chars)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("{}{}", Self::PREFIX, hex::encode(bytes)))
    }

    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tie-break: true if `self` is the side that opens the connection to `remote`.
    pub fn initiates_to(&self, remote: &PeerId) -> bool {
        self < remote
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Which side of the handshake we play
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Creates the data channel and sends the offer
    Initiator,
    /// Waits for an offer and answers it
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Connection state toward one remote peer.
///
/// Exactly one value exists per remote peer. `Connecting` may only be
/// re-entered from `Idle` or `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting(Role),
    Connected,
    Closed,
}

impl ConnectionState {
    /// Whether a connection object is alive for this state
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting(_) | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting(role) => write!(f, "connecting ({})", role),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// SESSION NEGOTIATION
// =============================================================================

/// Half of a description exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description produced by the connection primitive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Reachable network path proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

// =============================================================================
// SIGNALING
// =============================================================================

/// Kind of a signaling envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::Candidate => write!(f, "candidate"),
        }
    }
}

/// Signal payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Signaling message addressed to one peer.
///
/// Consumed exactly once by the receiver; redelivery must be harmless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub sender: PeerId,
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(sender: PeerId, signal: Signal) -> Self {
        Self { sender, signal }
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Value announcement carried over a data channel.
///
/// `seq` increases with every new local value of the sender, so a receiver
/// can discard updates delivered out of order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub seq: u64,
    pub value: i64,
}
