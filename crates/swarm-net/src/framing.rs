//! Data-channel framing
//!
//! Wire format:
//! - 1 byte: frame version
//! - 1 byte: frame type
//! - N bytes: postcard payload

use bytes::{BufMut, Bytes, BytesMut};
use swarm_core::ValueUpdate;
use thiserror::Error;

/// Current data-channel frame version
pub const FRAME_VERSION: u8 = 1;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Sender's current local value
    ValueUpdate = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ValueUpdate),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Message carried on a data channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelFrame {
    Value(ValueUpdate),
}

impl ChannelFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            ChannelFrame::Value(_) => FrameType::ValueUpdate,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload = match self {
            ChannelFrame::Value(update) => postcard::to_allocvec(update)?,
        };

        let mut dst = BytesMut::with_capacity(2 + payload.len());
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(self.frame_type() as u8);
        dst.put_slice(&payload);
        Ok(dst.freeze())
    }

    pub fn decode(src: &[u8]) -> Result<Self, FrameError> {
        if src.len() < 2 {
            return Err(FrameError::Truncated(src.len()));
        }
        if src[0] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(src[0]));
        }

        match FrameType::try_from(src[1])? {
            FrameType::ValueUpdate => Ok(ChannelFrame::Value(postcard::from_bytes(&src[2..])?)),
        }
    }
}
