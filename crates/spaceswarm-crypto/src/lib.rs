//! # Spaceswarm Crypto
//!
//! Cryptographic primitives for the Spaceswarm DHT and its peer connections.
//!
//! This crate provides:
//! - BLAKE3 hashing and namespaced domain-separation tags
//! - Ed25519 key pairs and signatures (deterministic from a 32-byte seed)
//! - z-base-32 text encoding of public keys (52 characters)
//! - `Noise_XX` handshake binding Ed25519 identities to the Noise static keys
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity | Ed25519 | 128-bit |
//! | Key Exchange | X25519 (Noise XX) | 128-bit |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod hash;
pub mod noise;
pub mod signatures;

pub use error::CryptoError;
pub use hash::{HashOutput, hash, namespace};
pub use noise::{NoiseHandshake, NoiseTransport};
pub use signatures::{KeyPair, PublicKey, Signature};

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 seed size
pub const SEED_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Length of a public key in its z-base-32 text form
pub const ENCODED_KEY_LEN: usize = 52;

/// AEAD tag overhead added to every Noise transport message
pub const NOISE_TAG_SIZE: usize = 16;

/// Largest Noise message (ciphertext) snow will produce or accept
pub const NOISE_MAX_MESSAGE: usize = 65535;
