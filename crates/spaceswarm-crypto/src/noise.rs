//! Noise_XX handshake protocol.
//!
//! Implements the Noise_XX pattern (snow) with an identity binding: the
//! X25519 static key is derived from the Ed25519 seed, and each side sends its
//! Ed25519 public key plus a signature over its static key as the encrypted
//! handshake payload. After the handshake both sides know the authenticated
//! Ed25519 key of the other side.
//!
//! ```text
//! Initiator                          Responder
//!   -> e                               (msg 1, empty payload)
//!   <- e, ee, s, es                    (msg 2, responder binding)
//!   -> s, se                           (msg 3, initiator binding)
//! ```

use crate::hash::Kdf;
use crate::signatures::{KeyPair, PublicKey, Signature, verify};
use crate::{CryptoError, NOISE_MAX_MESSAGE, NOISE_TAG_SIZE};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";
const STATIC_KEY_CONTEXT: &str = "spaceswarm 2024 noise static key";
const BINDING_DOMAIN: &[u8] = b"spaceswarm/noise-identity";
const BINDING_LEN: usize = 32 + 64;

/// Derive the X25519 static secret used in Noise for a key pair.
fn static_secret(key_pair: &KeyPair) -> [u8; 32] {
    Kdf::new(STATIC_KEY_CONTEXT).derive_key(&key_pair.seed())
}

fn static_public(secret: &[u8; 32]) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(*secret);
    x25519_dalek::PublicKey::from(&secret).to_bytes()
}

fn binding_message(static_key: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BINDING_DOMAIN.len() + static_key.len());
    msg.extend_from_slice(BINDING_DOMAIN);
    msg.extend_from_slice(static_key);
    msg
}

fn encode_binding(key_pair: &KeyPair, static_key: &[u8; 32]) -> Vec<u8> {
    let signature = key_pair.sign(&binding_message(static_key));
    let mut payload = Vec::with_capacity(BINDING_LEN);
    payload.extend_from_slice(key_pair.public_key().as_bytes());
    payload.extend_from_slice(signature.as_bytes());
    payload
}

fn decode_binding(payload: &[u8], remote_static: &[u8]) -> Result<PublicKey, CryptoError> {
    if payload.len() != BINDING_LEN {
        return Err(CryptoError::InvalidPayload(format!(
            "expected {BINDING_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let public_key = PublicKey::from_slice(&payload[..32])?;
    let signature = Signature::from_slice(&payload[32..])?;
    verify(&public_key, &binding_message(remote_static), &signature)?;
    Ok(public_key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Noise handshake state
pub struct NoiseHandshake {
    state: snow::HandshakeState,
    role: Role,
    binding: Vec<u8>,
    expected_remote: Option<PublicKey>,
    remote: Option<PublicKey>,
    messages: u8,
}

impl NoiseHandshake {
    /// Create a new handshake as the initiator
    ///
    /// When `expected_remote` is set, a responder authenticating any other key
    /// fails the handshake with [`CryptoError::RemoteKeyMismatch`].
    pub fn initiator(
        key_pair: &KeyPair,
        expected_remote: Option<PublicKey>,
    ) -> Result<Self, CryptoError> {
        Self::new(key_pair, Role::Initiator, expected_remote)
    }

    /// Create a new handshake as the responder
    pub fn responder(key_pair: &KeyPair) -> Result<Self, CryptoError> {
        Self::new(key_pair, Role::Responder, None)
    }

    fn new(
        key_pair: &KeyPair,
        role: Role,
        expected_remote: Option<PublicKey>,
    ) -> Result<Self, CryptoError> {
        let params: snow::params::NoiseParams = NOISE_PARAMS.parse()?;
        let secret = static_secret(key_pair);
        let builder = snow::Builder::new(params).local_private_key(&secret)?;
        let state = match role {
            Role::Initiator => builder.build_initiator()?,
            Role::Responder => builder.build_responder()?,
        };
        Ok(Self {
            state,
            role,
            binding: encode_binding(key_pair, &static_public(&secret)),
            expected_remote,
            remote: None,
            messages: 0,
        })
    }

    /// True when it is this side's turn to write
    #[must_use]
    pub fn is_my_turn(&self) -> bool {
        self.state.is_my_turn()
    }

    /// True once all three messages are processed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Remote identity, once authenticated
    #[must_use]
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote
    }

    /// Produce the next outgoing handshake message
    pub fn write_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        if !self.state.is_my_turn() || self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidState);
        }
        // The first initiator message is unencrypted, so it carries no identity.
        let payload: &[u8] = if self.role == Role::Initiator && self.messages == 0 {
            &[]
        } else {
            &self.binding
        };
        let mut buf = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self.state.write_message(payload, &mut buf)?;
        buf.truncate(len);
        self.messages += 1;
        Ok(buf)
    }

    /// Consume an incoming handshake message
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        if self.state.is_my_turn() || self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidState);
        }
        let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self.state.read_message(message, &mut payload)?;
        self.messages += 1;

        if len > 0 {
            let remote_static = self
                .state
                .get_remote_static()
                .ok_or_else(|| CryptoError::InvalidPayload("identity before static key".into()))?;
            let remote = decode_binding(&payload[..len], remote_static)?;
            if self.expected_remote.is_some_and(|expected| expected != remote) {
                return Err(CryptoError::RemoteKeyMismatch);
            }
            self.remote = Some(remote);
        }
        Ok(())
    }

    /// Complete handshake and switch to transport mode
    ///
    /// Returns the transport and the authenticated remote public key.
    pub fn into_transport(self) -> Result<(NoiseTransport, PublicKey), CryptoError> {
        if !self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidState);
        }
        let remote = self
            .remote
            .ok_or_else(|| CryptoError::InvalidPayload("remote never identified".into()))?;
        let state = self.state.into_transport_mode()?;
        Ok((NoiseTransport { state }, remote))
    }
}

/// Encrypted channel state after a finished handshake
pub struct NoiseTransport {
    state: snow::TransportState,
}

impl NoiseTransport {
    /// Largest plaintext that fits one Noise message
    pub const MAX_PLAINTEXT: usize = NOISE_MAX_MESSAGE - NOISE_TAG_SIZE;

    /// Encrypt one message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > Self::MAX_PLAINTEXT {
            return Err(CryptoError::EncryptionFailed);
        }
        let mut buf = vec![0u8; plaintext.len() + NOISE_TAG_SIZE];
        let len = self
            .state
            .write_message(plaintext, &mut buf)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Decrypt one message
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut buf)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        buf.truncate(len);
        Ok(buf)
    }
}
