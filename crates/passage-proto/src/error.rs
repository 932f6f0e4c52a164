//! Error types for protocol operations.

use thiserror::Error;

/// Errors that can occur while encoding, decoding, or validating
/// protocol data.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Input exceeds the size bound for its type.
    #[error("Input too large: {actual} bytes exceeds maximum {max}")]
    InputTooLarge {
        /// Maximum allowed bytes.
        max: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// Payload exceeds the allowed size for its container.
    #[error("Payload too large: {actual} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Maximum allowed bytes.
        max: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// Malformed peer id (wrong length or invalid hex).
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Malformed Ed25519 key material.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Signature does not verify.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The presented verifying key does not hash to the claimed peer id.
    #[error("Peer id does not match verifying key")]
    PeerIdMismatch,

    /// Unsupported protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Record or envelope past its wall-clock lifetime.
    #[error("Expired at {expired_at}, now {now}")]
    Expired {
        /// Expiry timestamp (unix seconds).
        expired_at: u64,
        /// Observed time (unix seconds).
        now: u64,
    },

    /// Hop budget exhausted.
    #[error("Hop budget exhausted")]
    HopBudgetExhausted,

    /// Announcement failed structural validation.
    #[error("Invalid announcement: {0}")]
    InvalidAnnouncement(String),

    /// Binary serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization failure.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<bincode::Error> for ProtoError {
    fn from(err: bincode::Error) -> Self {
        ProtoError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::Json(err.to_string())
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
