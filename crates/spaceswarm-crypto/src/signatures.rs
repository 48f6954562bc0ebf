//! Ed25519 key pairs, public keys and signatures.
//!
//! A node or server identity is an Ed25519 key pair. The public key is what
//! peers connect to; it has a 32-byte raw form and a 52-character z-base-32
//! text form.
//!
//! ## Usage
//!
//! ```
//! use spaceswarm_crypto::signatures::{KeyPair, verify};
//!
//! let key_pair = KeyPair::from_seed([7u8; 32]);
//! let signature = key_pair.sign(b"announce");
//! assert!(verify(&key_pair.public_key(), b"announce", &signature).is_ok());
//! ```

use crate::CryptoError;
use crate::encoding;
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Ed25519 public key (32 bytes)
///
/// Accepted at the connect boundary either raw or as its 52-character
/// z-base-32 encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Decode a 52-character z-base-32 key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyEncoding`] for any other shape.
    pub fn from_z32(text: &str) -> Result<Self, CryptoError> {
        encoding::decode_key(text).map(Self)
    }

    /// Encode as 52-character z-base-32 text
    #[must_use]
    pub fn to_z32(&self) -> String {
        encoding::encode_key(&self.0)
    }

    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copy out the raw key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_z32())
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Ed25519 key pair
///
/// The signing half is zeroized on drop by `ed25519_dalek`.
#[derive(Clone)]
pub struct KeyPair {
    inner: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    #[must_use]
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Derive a key pair deterministically from a 32-byte seed
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// The public half
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.verifying_key().to_bytes())
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Export the seed (use with care)
    #[must_use]
    pub fn seed(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` against `public_key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the key is not a valid curve
/// point and [`CryptoError::InvalidSignature`] if the signature does not verify.
pub fn verify(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}
