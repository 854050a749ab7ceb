//! Swarm Core Library
//!
//! Plain data shared by every part of the peer swarm.
//!
//! # Modules
//!
//! - [`types`]: Identity, connection state, session descriptions, signals
//! - [`wire`]: Versioned signaling frame schema (JSON)
//! - [`aggregate`]: The swarm maximum
//! - [`error`]: Error types

pub mod aggregate;
pub mod error;
pub mod types;
pub mod wire;

pub use aggregate::aggregate;
pub use error::{Error, Result};
pub use types::*;
pub use wire::{SignalingFrame, WIRE_VERSION};
