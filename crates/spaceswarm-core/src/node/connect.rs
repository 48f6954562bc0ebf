//! Client side of a connection attempt.

use crate::node::connection::{Connection, ConnectionMode};
use crate::node::error::{NodeError, Result};
use crate::node::node::Node;
use crate::secret_stream::SecretStream;
use spaceswarm_crypto::{ENCODED_KEY_LEN, KeyPair, PublicKey};
use spaceswarm_dht::{
    AllowAll, ConnectionPolicy, HolepunchError, HolepunchSession, HolepunchState,
    PeerConnectRequest, PeerPath, RelayInfo,
};
use spaceswarm_transport::{RawStream, loopback_pair};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time allowed for the encrypted handshake once a path exists
pub const CONNECT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// A remote key as accepted by [`Node::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    /// Raw key bytes; must be 32 long
    Bytes(Vec<u8>),
    /// 52-character z-base-32 text
    Text(String),
    /// Parsed key
    Key(PublicKey),
    /// No key given
    Missing,
}

impl KeyInput {
    /// Parse into a public key.
    ///
    /// # Errors
    /// [`NodeError::InvalidKey`] for missing, short or malformed input.
    pub fn resolve(self) -> Result<PublicKey> {
        match self {
            KeyInput::Key(key) => Ok(key),
            KeyInput::Bytes(bytes) => {
                if bytes.len() != 32 {
                    return Err(NodeError::InvalidKey(
                        format!("expected 32 bytes, got {}", bytes.len()).into(),
                    ));
                }
                Ok(PublicKey::from_slice(&bytes)?)
            }
            KeyInput::Text(text) => {
                if text.len() != ENCODED_KEY_LEN {
                    return Err(NodeError::InvalidKey(
                        format!("expected {} characters, got {}", ENCODED_KEY_LEN, text.len()).into(),
                    ));
                }
                Ok(PublicKey::from_z32(&text)?)
            }
            KeyInput::Missing => Err(NodeError::invalid_key("no key given")),
        }
    }
}

impl From<PublicKey> for KeyInput {
    fn from(key: PublicKey) -> Self {
        KeyInput::Key(key)
    }
}

impl From<&PublicKey> for KeyInput {
    fn from(key: &PublicKey) -> Self {
        KeyInput::Key(*key)
    }
}

impl From<[u8; 32]> for KeyInput {
    fn from(bytes: [u8; 32]) -> Self {
        KeyInput::Key(PublicKey::from_bytes(bytes))
    }
}

impl From<&[u8]> for KeyInput {
    fn from(bytes: &[u8]) -> Self {
        KeyInput::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for KeyInput {
    fn from(bytes: Vec<u8>) -> Self {
        KeyInput::Bytes(bytes)
    }
}

impl From<&str> for KeyInput {
    fn from(text: &str) -> Self {
        KeyInput::Text(text.to_string())
    }
}

impl From<String> for KeyInput {
    fn from(text: String) -> Self {
        KeyInput::Text(text)
    }
}

impl<T: Into<KeyInput>> From<Option<T>> for KeyInput {
    fn from(input: Option<T>) -> Self {
        input.map_or(KeyInput::Missing, Into::into)
    }
}

/// Per-connection settings
#[derive(Clone)]
pub struct ConnectOptions {
    /// Identity to authenticate as; the node's default key pair when `None`
    pub key_pair: Option<KeyPair>,
    /// Keep-alive interval; `None` inherits the node's, zero disables
    pub keep_alive: Option<Duration>,
    /// Share a socket with other reusable connections from the same key pair
    pub reusable_socket: bool,
    /// Try the server's LAN addresses when both sit behind the same public IP
    pub local_connection: bool,
    /// Relay node to fall back to when punching fails
    pub relay_through: Option<PublicKey>,
    /// Holepunch hook
    pub policy: Arc<dyn ConnectionPolicy>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            keep_alive: None,
            reusable_socket: false,
            local_connection: true,
            relay_through: None,
            policy: Arc::new(AllowAll),
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("keep_alive", &self.keep_alive)
            .field("reusable_socket", &self.reusable_socket)
            .field("local_connection", &self.local_connection)
            .field("relay_through", &self.relay_through)
            .finish_non_exhaustive()
    }
}

/// A connection attempt running in the background.
///
/// Await it for the [`Connection`]. Dropping the handle lets the attempt
/// finish and closes the resulting connection.
pub struct ConnectHandle {
    remote: PublicKey,
    state: watch::Receiver<HolepunchState>,
    task: JoinHandle<Result<Connection>>,
}

impl ConnectHandle {
    pub(crate) fn spawn(node: Node, remote: PublicKey, options: ConnectOptions) -> Self {
        let session = Arc::new(HolepunchSession::new());
        let state = session.subscribe();
        let task = tokio::spawn(async move {
            let mut destroyed = node.destroyed_signal();
            tokio::select! {
                result = connect(&node, remote, options, &session) => result,
                _ = destroyed.wait_for(|d| *d) => Err(NodeError::Destroyed),
            }
        });
        Self {
            remote,
            state,
            task,
        }
    }

    /// Key being connected to
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.remote
    }

    /// Current holepunch state
    #[must_use]
    pub fn state(&self) -> HolepunchState {
        self.state.borrow().clone()
    }

    /// Stream of holepunch state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<HolepunchState> {
        self.state.clone()
    }
}

impl IntoFuture for ConnectHandle {
    type Output = Result<Connection>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.task.await {
                Ok(result) => result,
                Err(e) => Err(NodeError::ConnectionFailed(e.to_string().into())),
            }
        })
    }
}

impl std::fmt::Debug for ConnectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectHandle")
            .field("remote", &self.remote)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Full connect flow: same-node shortcut, signaling, punching or relaying,
/// then the Noise handshake against the expected key.
pub(crate) async fn connect(
    node: &Node,
    remote: PublicKey,
    options: ConnectOptions,
    session: &HolepunchSession,
) -> Result<Connection> {
    let key_pair = options
        .key_pair
        .clone()
        .unwrap_or_else(|| node.default_key_pair().clone());
    let keep_alive = match options.keep_alive {
        Some(interval) => Some(interval).filter(|d| !d.is_zero()),
        None => node.config().keep_alive(),
    };

    if let Some(server) = node.local_server(&remote) {
        let (client_end, server_end) = loopback_pair();
        server.accept_local(Arc::new(server_end))?;
        let stream = handshake(Arc::new(client_end), &key_pair, remote).await?;
        if let Ok(addr) = node.dht().local_addr() {
            session.transition(HolepunchState::Connected { remote: addr });
        }
        tracing::debug!("connected to {} on the same node", remote);
        return Ok(Connection::new(stream, ConnectionMode::Local, None, None));
    }

    let dht = node.dht();
    let lease = node
        .socket_pool()
        .acquire(
            dht,
            key_pair.public_key(),
            options.relay_through.is_some(),
            options.reusable_socket,
        )
        .await?;
    let socket = lease.socket().clone();
    let stream = socket.create_stream();
    let local_addresses = match (options.local_connection, socket.local_addr()) {
        (true, Ok(bound)) => dht.local_addresses(bound.port()),
        _ => Vec::new(),
    };
    let request = PeerConnectRequest {
        socket: socket.clone(),
        key_pair: key_pair.clone(),
        remote_public_key: remote,
        stream_id: stream.id(),
        relay: options.relay_through.map(|relay_key| RelayInfo {
            relay_key,
            token: rand::random(),
        }),
        local_addresses,
        local_connection: options.local_connection,
        policy: Arc::clone(&options.policy),
    };

    let path = dht
        .connect_peer(request, session)
        .await
        .map_err(|e| match e {
            HolepunchError::PeerNotFound => NodeError::PeerNotFound(remote.to_bytes()),
            other => other.into(),
        })?;
    tracing::debug!("path to {}: {:?}", remote, path);

    let (raw, mode): (Arc<dyn RawStream>, ConnectionMode) = match path {
        PeerPath::Direct { remote, stream_id } => {
            stream.connect(Some(remote), stream_id).await;
            (Arc::new(stream), ConnectionMode::Direct)
        }
        PeerPath::Holepunched { remote, stream_id } => {
            stream.connect(Some(remote), stream_id).await;
            (Arc::new(stream), ConnectionMode::Holepunched)
        }
        PeerPath::Local { remote, stream_id } => {
            stream.connect(Some(remote), stream_id).await;
            (Arc::new(stream), ConnectionMode::Local)
        }
        PeerPath::Relayed { relay, .. } => {
            drop(stream);
            let channel = node
                .relay_channel(relay, true, options.reusable_socket)
                .await?;
            (Arc::new(channel), ConnectionMode::Relayed)
        }
    };

    let stream = handshake(raw, &key_pair, remote).await?;
    let connection = Connection::new(stream, mode, keep_alive, Some(socket));
    connection.on_close(move || drop(lease));
    Ok(connection)
}

async fn handshake(
    raw: Arc<dyn RawStream>,
    key_pair: &KeyPair,
    remote: PublicKey,
) -> Result<SecretStream> {
    tokio::time::timeout(
        CONNECT_HANDSHAKE_TIMEOUT,
        SecretStream::initiate(raw, key_pair, Some(remote)),
    )
    .await
    .map_err(|_| NodeError::timeout("encrypted handshake"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_input_forms() {
        let key = KeyPair::generate().public_key();
        assert_eq!(KeyInput::from(key).resolve().unwrap(), key);
        assert_eq!(KeyInput::from(key.to_bytes()).resolve().unwrap(), key);
        assert_eq!(KeyInput::from(key.as_bytes().as_slice()).resolve().unwrap(), key);
        assert_eq!(KeyInput::from(key.to_z32()).resolve().unwrap(), key);
        assert_eq!(KeyInput::from(Some(key)).resolve().unwrap(), key);
    }

    #[test]
    fn test_key_input_rejects_bad_input() {
        assert!(matches!(
            KeyInput::from("wrong-id").resolve(),
            Err(NodeError::InvalidKey(_))
        ));
        assert!(matches!(
            KeyInput::from(None::<PublicKey>).resolve(),
            Err(NodeError::InvalidKey(_))
        ));
        assert!(matches!(
            KeyInput::from(vec![1u8; 31]).resolve(),
            Err(NodeError::InvalidKey(_))
        ));
        let garbage = "!".repeat(ENCODED_KEY_LEN);
        assert!(matches!(
            KeyInput::from(garbage.as_str()).resolve(),
            Err(NodeError::InvalidKey(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_resolve_text_never_panics(text in ".{0,80}") {
            let _ = KeyInput::from(text).resolve();
        }

        #[test]
        fn prop_z32_resolves_to_same_key(seed in proptest::prelude::any::<[u8; 32]>()) {
            let key = KeyPair::from_seed(seed).public_key();
            proptest::prop_assert_eq!(KeyInput::from(key.to_z32()).resolve().unwrap(), key);
        }
    }

    #[test]
    fn test_connect_options_defaults() {
        let options = ConnectOptions::default();
        assert!(options.local_connection);
        assert!(!options.reusable_socket);
        assert!(options.keep_alive.is_none());
        assert!(options.relay_through.is_none());
    }
}
