//! Noise-encrypted message stream over any [`RawStream`].
//!
//! The handshake runs three `Noise_XX` messages over the raw stream and
//! authenticates both Ed25519 identities. Afterwards every raw message carries
//! one ciphertext. Writes are serialized so nonces reach the wire in order.

use crate::node::error::{NodeError, Result};
use spaceswarm_crypto::{KeyPair, NOISE_TAG_SIZE, NoiseHandshake, NoiseTransport, PublicKey};
use spaceswarm_transport::RawStream;
use std::sync::{Arc, Mutex};

/// Authenticated encrypted stream
pub struct SecretStream {
    raw: Arc<dyn RawStream>,
    cipher: Mutex<NoiseTransport>,
    write_lock: tokio::sync::Mutex<()>,
    local_public_key: PublicKey,
    remote_public_key: PublicKey,
}

impl SecretStream {
    /// Run the handshake as initiator.
    ///
    /// # Errors
    /// - [`NodeError::RemoteKeyMismatch`] if `expected` is set and the remote proves another key
    /// - [`NodeError::Handshake`] on any other handshake failure
    /// - [`NodeError::ConnectionClosed`] if the raw stream ends first
    pub async fn initiate(
        raw: Arc<dyn RawStream>,
        key_pair: &KeyPair,
        expected: Option<PublicKey>,
    ) -> Result<Self> {
        let mut handshake = NoiseHandshake::initiator(key_pair, expected)?;
        raw.send(&handshake.write_message()?).await?;
        handshake.read_message(&next_message(raw.as_ref()).await?)?;
        raw.send(&handshake.write_message()?).await?;
        Self::finish(raw, key_pair, handshake)
    }

    /// Run the handshake as responder.
    ///
    /// # Errors
    /// As [`initiate`](Self::initiate), without the key check.
    pub async fn respond(raw: Arc<dyn RawStream>, key_pair: &KeyPair) -> Result<Self> {
        let mut handshake = NoiseHandshake::responder(key_pair)?;
        handshake.read_message(&next_message(raw.as_ref()).await?)?;
        raw.send(&handshake.write_message()?).await?;
        handshake.read_message(&next_message(raw.as_ref()).await?)?;
        Self::finish(raw, key_pair, handshake)
    }

    fn finish(raw: Arc<dyn RawStream>, key_pair: &KeyPair, handshake: NoiseHandshake) -> Result<Self> {
        let (cipher, remote_public_key) = handshake.into_transport()?;
        tracing::debug!(
            "secret stream established with {}",
            hex::encode(&remote_public_key.as_bytes()[..8])
        );
        Ok(Self {
            raw,
            cipher: Mutex::new(cipher),
            write_lock: tokio::sync::Mutex::new(()),
            local_public_key: key_pair.public_key(),
            remote_public_key,
        })
    }

    /// Our key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.local_public_key
    }

    /// Authenticated remote key
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    /// Underlying raw stream
    #[must_use]
    pub fn raw(&self) -> &Arc<dyn RawStream> {
        &self.raw
    }

    /// Largest plaintext carried by one message
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.raw
            .max_message_size()
            .min(NoiseTransport::MAX_PLAINTEXT + NOISE_TAG_SIZE)
            - NOISE_TAG_SIZE
    }

    /// Encrypt and send one message.
    ///
    /// # Errors
    /// [`NodeError::Transport`] if the message is too large, or the stream error.
    pub async fn send(&self, message: &[u8]) -> Result<()> {
        let max = self.max_message_size();
        if message.len() > max {
            return Err(NodeError::Transport(
                format!("message of {} bytes exceeds {}", message.len(), max).into(),
            ));
        }
        let _order = self.write_lock.lock().await;
        let ciphertext = self
            .cipher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .encrypt(message)?;
        self.raw.send(&ciphertext).await?;
        Ok(())
    }

    /// Send `data` split into as many messages as needed.
    ///
    /// # Errors
    /// The first send failure.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let max = self.max_message_size();
        for chunk in data.chunks(max) {
            self.send(chunk).await?;
        }
        Ok(())
    }

    /// Receive and decrypt the next message; `None` once the remote ended.
    ///
    /// # Errors
    /// Stream failure or a ciphertext that does not authenticate.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let Some(ciphertext) = self.raw.recv().await? else {
            return Ok(None);
        };
        let plaintext = self
            .cipher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .decrypt(&ciphertext)?;
        Ok(Some(plaintext))
    }

    /// Half-close for writing.
    ///
    /// # Errors
    /// Stream failure.
    pub async fn end(&self) -> Result<()> {
        let _order = self.write_lock.lock().await;
        self.raw.end().await?;
        Ok(())
    }

    /// Abort the stream.
    pub async fn close(&self) {
        self.raw.close().await;
    }
}

impl std::fmt::Debug for SecretStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStream")
            .field("local", &self.local_public_key)
            .field("remote", &self.remote_public_key)
            .finish()
    }
}

async fn next_message(raw: &dyn RawStream) -> Result<Vec<u8>> {
    raw.recv()
        .await?
        .ok_or(NodeError::handshake("stream ended during handshake"))
}
