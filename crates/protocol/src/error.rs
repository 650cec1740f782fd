//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering envelope, addressing and crypto failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope could not be decoded: malformed JSON, unknown `type`
    /// tag, or a missing field.
    #[error("invalid envelope: {0}")]
    Envelope(String),

    /// A hardware address string did not parse as an IEEE-802 address.
    #[error("invalid hardware address: {0}")]
    InvalidMac(String),

    /// A community key was supplied with a length other than 16, 24 or 32
    /// bytes.
    #[error("invalid community key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),

    /// Sealing a payload failed.
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Opening a payload failed: truncated input, wrong key, or a failed
    /// authentication tag.
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Envelope(err.to_string())
    }
}
