//! Signaling Transport Adapter
//!
//! Normalizes the bootstrap backends (a mailbox-style key-value store and a
//! chat-style relay) behind one interface. Inbound traffic is translated to
//! reactor events: `Discovered`, `Alive`, `Departed` and `Signal`.

use crate::event::EventSender;
use swarm_core::{PeerId, SignalEnvelope};
use thiserror::Error;

/// Signaling transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Signaling transport unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(PeerId),
    #[error("Encoding error: {0}")]
    Encoding(#[from] swarm_core::Error),
}

/// Bootstrap channel used to exchange handshake metadata
pub trait SignalingTransport: Send {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Start delivering inbound traffic for `local` to `events`
    fn subscribe(&mut self, local: &PeerId, events: EventSender) -> Result<(), TransportError>;

    /// Make `local` discoverable
    fn announce_presence(&mut self, local: &PeerId) -> Result<(), TransportError>;

    /// Stop being discoverable
    fn withdraw_presence(&mut self, local: &PeerId) -> Result<(), TransportError>;

    /// Deliver an envelope to one peer
    fn publish(&mut self, recipient: &PeerId, envelope: &SignalEnvelope)
        -> Result<(), TransportError>;

    /// Periodic liveness signal
    fn heartbeat(&mut self, local: &PeerId) -> Result<(), TransportError>;

    /// Introduce ourselves directly to a newly discovered peer.
    ///
    /// Backends whose discovery is already symmetric need not do anything.
    fn greet(&mut self, _local: &PeerId, _peer: &PeerId) -> Result<(), TransportError> {
        Ok(())
    }
}
