//! Connection primitive boundary
//!
//! The primitive that performs the real network handshake is external. It is
//! driven through non-blocking calls; every result (generated descriptions,
//! gathered candidates, state changes, channel traffic, rejections) comes
//! back later as a [`ConnectionEvent`] on the owner's event queue.

use crate::event::{EventSender, LinkId};
use bytes::Bytes;
use swarm_core::{IceCandidate, PeerId, SessionDescription};
use thiserror::Error;

/// Connection primitive errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection setup failed: {0}")]
    Setup(String),
    #[error("Data channel not open")]
    NotOpen,
}

/// Settings handed to every new connection object
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Label of the data channel opened by the initiator
    pub channel_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "swarm".to_string(),
        }
    }
}

/// Factory for connection objects
pub trait Connector: Send {
    /// Create a connection object toward `remote`.
    ///
    /// All callbacks of the returned object are posted to `events` as
    /// `Event::Connection { peer: remote, link, .. }`.
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link: LinkId,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Box<dyn PeerConnection>, LinkError>;
}

/// One connection object toward one remote peer
pub trait PeerConnection: Send {
    /// Create the local data channel (initiator only)
    fn create_data_channel(&mut self, label: &str);

    /// Generate an offer and apply it locally; completes with `LocalDescription`
    fn create_offer(&mut self);

    /// Generate an answer to the applied remote offer and apply it locally;
    /// completes with `LocalDescription`
    fn create_answer(&mut self);

    /// Apply the remote description; rejection completes with `NegotiationFailed`
    fn set_remote_description(&mut self, desc: SessionDescription);

    /// Apply a remote candidate; rejection completes with `NegotiationFailed`
    fn add_candidate(&mut self, candidate: IceCandidate);

    /// Send bytes on the data channel
    fn send(&mut self, data: Bytes) -> Result<(), LinkError>;

    /// Release the connection and its data channel
    fn close(&mut self);
}
