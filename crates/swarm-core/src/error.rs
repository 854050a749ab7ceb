//! Error types for the swarm wire formats

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Decoding and encoding errors.
///
/// Every variant means "discard the message, change no state".
#[derive(Debug, Error)]
pub enum Error {
    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carries a wire version we do not speak
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Well-formed JSON with an unknown kind or a payload that does not fit it
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}
