//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Text-encoded key could not be decoded
    #[error("invalid key encoding")]
    InvalidKeyEncoding,

    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Handshake message arrived in the wrong state
    #[error("invalid state for operation")]
    InvalidState,

    /// Remote identity payload was missing or malformed
    #[error("invalid handshake payload: {0}")]
    InvalidPayload(String),

    /// Remote authenticated a different public key than the one expected
    #[error("remote public key mismatch")]
    RemoteKeyMismatch,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,
}

impl From<snow::Error> for CryptoError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => CryptoError::DecryptionFailed,
            other => CryptoError::Handshake(other.to_string()),
        }
    }
}
