//! Signaling frame schema
//!
//! Both bootstrap backends carry the same versioned JSON frame:
//!
//! ```text
//! {"v":1,"kind":"offer","sender":"peer-0a1b2c3d4e5f","payload":{"type":"offer","sdp":"..."}}
//! ```
//!
//! `kind` is one of `hello`, `offer`, `answer`, `candidate`. Hello frames
//! carry a `null` payload and are only used by broadcast-style backends.

use crate::error::{Error, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Current signaling wire version
pub const WIRE_VERSION: u8 = 1;

const KIND_HELLO: &str = "hello";
const KIND_OFFER: &str = "offer";
const KIND_ANSWER: &str = "answer";
const KIND_CANDIDATE: &str = "candidate";

#[derive(Serialize, Deserialize)]
struct RawFrame {
    v: u8,
    kind: String,
    sender: PeerId,
    #[serde(default)]
    payload: serde_json::Value,
}

/// A decoded signaling frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingFrame {
    /// Liveness announcement
    Hello(PeerId),
    /// Handshake message
    Signal(SignalEnvelope),
}

impl SignalingFrame {
    pub fn sender(&self) -> &PeerId {
        match self {
            SignalingFrame::Hello(peer) => peer,
            SignalingFrame::Signal(envelope) => &envelope.sender,
        }
    }

    /// Encode to the JSON text form
    pub fn encode(&self) -> Result<String> {
        let raw = match self {
            SignalingFrame::Hello(peer) => RawFrame {
                v: WIRE_VERSION,
                kind: KIND_HELLO.to_string(),
                sender: peer.clone(),
                payload: serde_json::Value::Null,
            },
            SignalingFrame::Signal(envelope) => {
                let (kind, payload) = match &envelope.signal {
                    Signal::Offer(desc) => (KIND_OFFER, serde_json::to_value(desc)?),
                    Signal::Answer(desc) => (KIND_ANSWER, serde_json::to_value(desc)?),
                    Signal::Candidate(candidate) => {
                        (KIND_CANDIDATE, serde_json::to_value(candidate)?)
                    }
                };
                RawFrame {
                    v: WIRE_VERSION,
                    kind: kind.to_string(),
                    sender: envelope.sender.clone(),
                    payload,
                }
            }
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Decode from the JSON text form
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;
        if raw.v != WIRE_VERSION {
            return Err(Error::UnsupportedVersion(raw.v));
        }

        let signal = match raw.kind.as_str() {
            KIND_HELLO => return Ok(SignalingFrame::Hello(raw.sender)),
            KIND_OFFER => Signal::Offer(description(raw.payload, SdpType::Offer)?),
            KIND_ANSWER => Signal::Answer(description(raw.payload, SdpType::Answer)?),
            KIND_CANDIDATE => Signal::Candidate(serde_json::from_value(raw.payload)?),
            other => {
                return Err(Error::MalformedPayload(format!("unknown kind {:?}", other)));
            }
        };

        Ok(SignalingFrame::Signal(SignalEnvelope::new(raw.sender, signal)))
    }
}

impl From<SignalEnvelope> for SignalingFrame {
    fn from(envelope: SignalEnvelope) -> Self {
        SignalingFrame::Signal(envelope)
    }
}

fn description(payload: serde_json::Value, expected: SdpType) -> Result<SessionDescription> {
    let desc: SessionDescription = serde_json::from_value(payload)?;
    if desc.sdp_type != expected {
        return Err(Error::MalformedPayload(format!(
            "{:?} description in {:?} frame",
            desc.sdp_type, expected
        )));
    }
    Ok(desc)
}
