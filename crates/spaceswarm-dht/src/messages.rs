//! DHT wire messages.
//!
//! Every DHT datagram is a bincode-encoded [`Message`]. Command payloads are
//! themselves bincode structs carried in the `value` field. Protocol
//! enumerations travel as their numeric code; codes this version does not know
//! decode to an `Unrecognized` variant that handlers reject.

use crate::node_id::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spaceswarm_crypto::hash::DHT_NAMESPACE;
use spaceswarm_crypto::{KeyPair, PublicKey, Signature, namespace};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Message encoding errors
#[derive(Debug, Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Malformed bytes
    #[error("decode failed: {0}")]
    Decode(String),

    /// A required field is missing
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Signature does not verify
    #[error("invalid signature")]
    InvalidSignature,
}

/// Encode any payload with bincode.
///
/// # Errors
/// Returns [`MessageError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    bincode::serialize(value).map_err(|e| MessageError::Encode(e.to_string()))
}

/// Decode any payload with bincode.
///
/// # Errors
/// Returns [`MessageError::Decode`] on malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    bincode::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))
}

/// Milliseconds since the Unix epoch on the local clock
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Freshness stamp for ANNOUNCE / UNANNOUNCE: wall-clock milliseconds,
/// strictly increasing within this process.
#[must_use]
pub fn next_stamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = unix_millis();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let stamp = now.max(last + 1);
        match LAST.compare_exchange_weak(last, stamp, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return stamp,
            Err(current) => last = current,
        }
    }
}

// ============================================================================
// Protocol enumerations
// ============================================================================

/// User-level DHT commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Command {
    /// Signaling: noise-less connection handshake
    PeerHandshake,
    /// Signaling: holepunch round
    PeerHolepunch,
    /// Find the record of a server key
    FindPeer,
    /// Find announced peers of a topic
    Lookup,
    /// Announce a peer under a topic
    Announce,
    /// Remove an announcement
    Unannounce,
    /// Store a signed mutable value
    MutablePut,
    /// Fetch a mutable value
    MutableGet,
    /// Store a content-addressed value
    ImmutablePut,
    /// Fetch a content-addressed value
    ImmutableGet,
    /// Unknown command code
    Unrecognized(u8),
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::PeerHandshake,
            1 => Self::PeerHolepunch,
            2 => Self::FindPeer,
            3 => Self::Lookup,
            4 => Self::Announce,
            5 => Self::Unannounce,
            6 => Self::MutablePut,
            7 => Self::MutableGet,
            8 => Self::ImmutablePut,
            9 => Self::ImmutableGet,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        match command {
            Command::PeerHandshake => 0,
            Command::PeerHolepunch => 1,
            Command::FindPeer => 2,
            Command::Lookup => 3,
            Command::Announce => 4,
            Command::Unannounce => 5,
            Command::MutablePut => 6,
            Command::MutableGet => 7,
            Command::ImmutablePut => 8,
            Command::ImmutableGet => 9,
            Command::Unrecognized(code) => code,
        }
    }
}

const SIGNED_COMMANDS: [Command; 5] = [
    Command::Announce,
    Command::Unannounce,
    Command::MutablePut,
    Command::PeerHandshake,
    Command::PeerHolepunch,
];

fn namespace_tags() -> &'static [[u8; 32]] {
    static TAGS: OnceLock<Vec<[u8; 32]>> = OnceLock::new();
    TAGS.get_or_init(|| {
        let ids: Vec<u8> = SIGNED_COMMANDS.iter().map(|c| u8::from(*c)).collect();
        namespace(DHT_NAMESPACE, &ids)
    })
}

impl Command {
    /// Domain-separation tag for commands whose payloads are signed
    #[must_use]
    pub fn namespace_tag(self) -> Option<&'static [u8; 32]> {
        SIGNED_COMMANDS
            .iter()
            .position(|c| *c == self)
            .map(|i| &namespace_tags()[i])
    }
}

/// Node-to-node maintenance commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum InternalCommand {
    /// Liveness check
    Ping,
    /// Ask for an unsolicited probe from a fresh socket
    PingNat,
    /// Closest nodes to a target
    FindNode,
    /// A contact the receiver returned is unreachable
    DownHint,
    /// Unknown internal code
    Unrecognized(u8),
}

impl From<u8> for InternalCommand {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Ping,
            1 => Self::PingNat,
            2 => Self::FindNode,
            3 => Self::DownHint,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<InternalCommand> for u8 {
    fn from(command: InternalCommand) -> Self {
        match command {
            InternalCommand::Ping => 0,
            InternalCommand::PingNat => 1,
            InternalCommand::FindNode => 2,
            InternalCommand::DownHint => 3,
            InternalCommand::Unrecognized(code) => code,
        }
    }
}

/// Error codes carried in responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ErrorCode {
    /// Success
    None,
    /// Rejected by policy or malformed
    Aborted,
    /// Peer speaks another protocol version
    VersionMismatch,
    /// Temporarily unable to serve
    TryLater,
    /// Same sequence number with a different value
    SeqReused,
    /// Sequence number below the stored one
    SeqTooLow,
    /// Unknown error code
    Unrecognized(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Aborted,
            2 => Self::VersionMismatch,
            3 => Self::TryLater,
            16 => Self::SeqReused,
            17 => Self::SeqTooLow,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::None => 0,
            ErrorCode::Aborted => 1,
            ErrorCode::VersionMismatch => 2,
            ErrorCode::TryLater => 3,
            ErrorCode::SeqReused => 16,
            ErrorCode::SeqTooLow => 17,
            ErrorCode::Unrecognized(code) => code,
        }
    }
}

/// NAT / firewall classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum FirewallClass {
    /// Not yet probed
    #[default]
    Unknown,
    /// Reachable without prior outbound traffic
    Open,
    /// Stable external port across remotes
    Consistent,
    /// External port changes per remote
    Random,
    /// Unknown classification code
    Unrecognized(u8),
}

impl From<u8> for FirewallClass {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Open,
            2 => Self::Consistent,
            3 => Self::Random,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<FirewallClass> for u8 {
    fn from(class: FirewallClass) -> Self {
        match class {
            FirewallClass::Unknown => 0,
            FirewallClass::Open => 1,
            FirewallClass::Consistent => 2,
            FirewallClass::Random => 3,
            FirewallClass::Unrecognized(code) => code,
        }
    }
}

/// Role of a signaling message on its way between client and server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SignalMode {
    /// Client to rendezvous
    FromClient,
    /// Rendezvous to server
    FromRelay,
    /// Server answer
    Reply,
    /// Unknown mode code
    Unrecognized(u8),
}

impl From<u8> for SignalMode {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::FromClient,
            1 => Self::FromRelay,
            2 => Self::Reply,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<SignalMode> for u8 {
    fn from(mode: SignalMode) -> Self {
        match mode {
            SignalMode::FromClient => 0,
            SignalMode::FromRelay => 1,
            SignalMode::Reply => 2,
            SignalMode::Unrecognized(code) => code,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Node maintenance
    Internal(InternalCommand),
    /// User-level command
    User(Command),
}

/// Node id plus address, as exchanged in `closer_nodes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Node id
    pub id: NodeId,
    /// Address
    pub addr: SocketAddr,
}

/// DHT request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Sender protocol version
    pub version: u8,
    /// Transaction id chosen by the sender
    pub tid: u32,
    /// Sender id; absent for ephemeral nodes
    pub id: Option<NodeId>,
    /// Address the sender sent to
    pub to: SocketAddr,
    /// Command
    pub kind: RequestKind,
    /// Target key or id
    pub target: Option<[u8; 32]>,
    /// Command payload
    pub value: Option<Vec<u8>>,
}

/// DHT response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Transaction id of the request
    pub tid: u32,
    /// Responder id; absent for ephemeral nodes
    pub id: Option<NodeId>,
    /// Requester address as observed by the responder
    pub to: SocketAddr,
    /// Nodes closer to the target
    pub closer_nodes: Vec<PeerAddr>,
    /// Error code
    pub error: ErrorCode,
    /// Command result
    pub value: Option<Vec<u8>>,
}

/// DHT datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request
    Request(Request),
    /// Response
    Response(Response),
}

impl Message {
    /// Encode for the wire.
    ///
    /// # Errors
    /// Returns [`MessageError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        encode(self)
    }

    /// Decode from the wire.
    ///
    /// # Errors
    /// Returns [`MessageError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        decode(bytes)
    }
}

// ============================================================================
// Command payloads
// ============================================================================

/// Announced peer, as stored and returned by LOOKUP / FIND_PEER
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Announcing key
    pub public_key: PublicKey,
    /// Nodes that can forward signaling to the peer
    pub relay_addresses: Vec<SocketAddr>,
}

/// ANNOUNCE payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    /// Record to store
    pub peer: PeerRecord,
    /// Freshness stamp, see [`next_stamp`]
    pub stamp: u64,
    /// Signature of the announcer
    pub signature: Signature,
}

/// UNANNOUNCE payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnannounceRequest {
    /// Key whose announcement is removed
    pub public_key: PublicKey,
    /// Freshness stamp, see [`next_stamp`]
    pub stamp: u64,
    /// Signature of that key
    pub signature: Signature,
}

/// MUTABLE_PUT payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutablePutRequest {
    /// Signing key
    pub public_key: PublicKey,
    /// Sequence number
    pub seq: u64,
    /// Value bytes
    pub value: Vec<u8>,
    /// Optional salt mixed into the key
    pub salt: Option<Vec<u8>>,
    /// Signature over seq, salt and value
    pub signature: Signature,
}

/// MUTABLE_GET result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableValue {
    /// Sequence number
    pub seq: u64,
    /// Value bytes
    pub value: Vec<u8>,
    /// Signature over seq, salt and value
    pub signature: Signature,
}

impl AnnounceRequest {
    /// Sign `peer` for storage under `target` at `stamp`.
    ///
    /// # Errors
    /// Fails if the record cannot be encoded.
    pub fn sign(
        key_pair: &KeyPair,
        target: &[u8; 32],
        peer: PeerRecord,
        stamp: u64,
    ) -> Result<Self, MessageError> {
        let message = Self::signed_bytes(target, &peer, stamp)?;
        Ok(Self {
            peer,
            stamp,
            signature: key_pair.sign(&message),
        })
    }

    /// Check the announcer's signature for `target`.
    ///
    /// # Errors
    /// [`MessageError::InvalidSignature`] if it does not verify.
    pub fn verify(&self, target: &[u8; 32]) -> Result<(), MessageError> {
        let message = Self::signed_bytes(target, &self.peer, self.stamp)?;
        spaceswarm_crypto::signatures::verify(&self.peer.public_key, &message, &self.signature)
            .map_err(|_| MessageError::InvalidSignature)
    }

    fn signed_bytes(target: &[u8; 32], peer: &PeerRecord, stamp: u64) -> Result<Vec<u8>, MessageError> {
        let body = encode(peer)?;
        signable(
            Command::Announce,
            &[target.as_slice(), body.as_slice(), stamp.to_le_bytes().as_slice()],
        )
    }
}

impl UnannounceRequest {
    /// Sign the removal of `key_pair`'s announcement under `target` at `stamp`.
    ///
    /// # Errors
    /// Fails only on an internal namespace error.
    pub fn sign(key_pair: &KeyPair, target: &[u8; 32], stamp: u64) -> Result<Self, MessageError> {
        let public_key = key_pair.public_key();
        let message = Self::signed_bytes(target, &public_key, stamp)?;
        Ok(Self {
            public_key,
            stamp,
            signature: key_pair.sign(&message),
        })
    }

    /// Check the signature for `target`.
    ///
    /// # Errors
    /// [`MessageError::InvalidSignature`] if it does not verify.
    pub fn verify(&self, target: &[u8; 32]) -> Result<(), MessageError> {
        let message = Self::signed_bytes(target, &self.public_key, self.stamp)?;
        spaceswarm_crypto::signatures::verify(&self.public_key, &message, &self.signature)
            .map_err(|_| MessageError::InvalidSignature)
    }

    fn signed_bytes(
        target: &[u8; 32],
        public_key: &PublicKey,
        stamp: u64,
    ) -> Result<Vec<u8>, MessageError> {
        signable(
            Command::Unannounce,
            &[target.as_slice(), public_key.as_bytes().as_slice(), stamp.to_le_bytes().as_slice()],
        )
    }
}

impl MutablePutRequest {
    /// Build a signed mutable record.
    ///
    /// # Errors
    /// Fails only on an internal namespace error.
    pub fn sign(
        key_pair: &KeyPair,
        seq: u64,
        value: Vec<u8>,
        salt: Option<Vec<u8>>,
    ) -> Result<Self, MessageError> {
        let body = mutable_signable(seq, salt.as_deref(), &value);
        let signature = key_pair.sign(&signable(Command::MutablePut, &[body.as_slice()])?);
        Ok(Self {
            public_key: key_pair.public_key(),
            seq,
            value,
            salt,
            signature,
        })
    }

    /// Check the record signature.
    ///
    /// # Errors
    /// [`MessageError::InvalidSignature`] if it does not verify.
    pub fn verify(&self) -> Result<(), MessageError> {
        verify_mutable(
            &self.public_key,
            self.seq,
            self.salt.as_deref(),
            &self.value,
            &self.signature,
        )
    }
}

/// Verify a mutable record signature, as done by getters on returned values.
///
/// # Errors
/// [`MessageError::InvalidSignature`] if it does not verify.
pub fn verify_mutable(
    public_key: &PublicKey,
    seq: u64,
    salt: Option<&[u8]>,
    value: &[u8],
    signature: &Signature,
) -> Result<(), MessageError> {
    let body = mutable_signable(seq, salt, value);
    let message = signable(Command::MutablePut, &[body.as_slice()])?;
    spaceswarm_crypto::signatures::verify(public_key, &message, signature)
        .map_err(|_| MessageError::InvalidSignature)
}

/// Relay path agreed during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Key of the relaying node
    pub relay_key: PublicKey,
    /// Pairing token presented by both sides
    pub token: [u8; 32],
}

/// PEER_HANDSHAKE body, signed by its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Server key the client wants to reach
    pub target_key: PublicKey,
    /// Author's firewall classification
    pub firewall: FirewallClass,
    /// Author's candidate addresses
    pub addresses: Vec<SocketAddr>,
    /// Author's stream id
    pub stream_id: u32,
    /// Holepunch session id
    pub session: u32,
    /// Relay path, when one is available
    pub relay: Option<RelayInfo>,
    /// Rejection reason in replies
    pub error: ErrorCode,
}

/// Holepunch phase requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchPhase {
    /// Fire probes now
    Punch,
    /// Give up punching and meet at the relay
    Relay,
    /// Stop; the client gave up
    Abort,
}

/// PEER_HOLEPUNCH body, signed by its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolepunchPayload {
    /// Holepunch session id
    pub session: u32,
    /// Round number
    pub round: u32,
    /// Requested phase
    pub phase: PunchPhase,
    /// Author's firewall classification
    pub firewall: FirewallClass,
    /// Author's candidate addresses
    pub addresses: Vec<SocketAddr>,
    /// Rejection reason in replies
    pub error: ErrorCode,
}

/// Payload signed by its author under a command namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    /// Author key
    pub public_key: PublicKey,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Signature over namespace tag and payload
    pub signature: Signature,
}

impl SignedPayload {
    /// Encode and sign `payload` for `command`.
    ///
    /// # Errors
    /// Fails if `command` is not a signed command or encoding fails.
    pub fn sign<T: Serialize>(
        key_pair: &KeyPair,
        command: Command,
        payload: &T,
    ) -> Result<Self, MessageError> {
        let payload = encode(payload)?;
        let signature = key_pair.sign(&signable(command, &[payload.as_slice()])?);
        Ok(Self {
            public_key: key_pair.public_key(),
            payload,
            signature,
        })
    }

    /// Verify the signature and decode the payload.
    ///
    /// # Errors
    /// [`MessageError::InvalidSignature`] or a decode error.
    pub fn open<T: DeserializeOwned>(&self, command: Command) -> Result<T, MessageError> {
        let message = signable(command, &[self.payload.as_slice()])?;
        spaceswarm_crypto::signatures::verify(&self.public_key, &message, &self.signature)
            .map_err(|_| MessageError::InvalidSignature)?;
        decode(&self.payload)
    }
}

/// Signaling envelope for PEER_HANDSHAKE and PEER_HOLEPUNCH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Leg of the exchange
    pub mode: SignalMode,
    /// Client address as seen by the rendezvous (set on `FromRelay`)
    pub peer_address: Option<SocketAddr>,
    /// Author-signed body
    pub signed: SignedPayload,
}

/// Unsolicited probe sent from a fresh socket in answer to PING_NAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatProbe {
    /// Token from the PING_NAT request
    pub token: u64,
}

/// Holepunch probe datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// Holepunch session id
    pub session: u32,
    /// True for the answer to a probe
    pub echo: bool,
}

/// Build the byte string signed for `command`: its namespace tag followed by `parts`.
///
/// # Errors
/// [`MessageError::MissingField`] if `command` is not a signed command.
pub fn signable(command: Command, parts: &[&[u8]]) -> Result<Vec<u8>, MessageError> {
    let tag = command
        .namespace_tag()
        .ok_or(MessageError::MissingField("namespace"))?;
    let mut out = Vec::with_capacity(32 + parts.iter().map(|p| p.len()).sum::<usize>());
    out.extend_from_slice(tag);
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Signable bytes of a mutable record
#[must_use]
pub fn mutable_signable(seq: u64, salt: Option<&[u8]>, value: &[u8]) -> Vec<u8> {
    let salt = salt.unwrap_or_default();
    let mut parts = Vec::with_capacity(8 + 4 + salt.len() + value.len());
    parts.extend_from_slice(&seq.to_be_bytes());
    parts.extend_from_slice(&(salt.len() as u32).to_be_bytes());
    parts.extend_from_slice(salt);
    parts.extend_from_slice(value);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_stable() {
        for code in 0u8..10 {
            assert_eq!(u8::from(Command::from(code)), code);
        }
        assert_eq!(u8::from(Command::Announce), 4);
        assert_eq!(u8::from(Command::ImmutableGet), 9);
        assert_eq!(Command::from(42), Command::Unrecognized(42));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(u8::from(ErrorCode::SeqReused), 16);
        assert_eq!(u8::from(ErrorCode::SeqTooLow), 17);
        assert_eq!(ErrorCode::from(4), ErrorCode::Unrecognized(4));
    }

    #[test]
    fn test_firewall_codes() {
        assert_eq!(u8::from(FirewallClass::Consistent), 2);
        assert_eq!(FirewallClass::from(3), FirewallClass::Random);
        assert_eq!(FirewallClass::default(), FirewallClass::Unknown);
    }

    #[test]
    fn test_enums_encode_as_single_byte() {
        assert_eq!(encode(&Command::MutablePut).unwrap(), vec![6]);
        assert_eq!(encode(&ErrorCode::SeqTooLow).unwrap(), vec![17]);
        let decoded: FirewallClass = decode(&[9]).unwrap();
        assert_eq!(decoded, FirewallClass::Unrecognized(9));
    }

    #[test]
    fn test_namespace_tags_distinct() {
        let tags: Vec<_> = SIGNED_COMMANDS
            .iter()
            .filter_map(|c| c.namespace_tag())
            .collect();
        assert_eq!(tags.len(), 5);
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(Command::Lookup.namespace_tag().is_none());
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::Request(Request {
            version: PROTOCOL_VERSION,
            tid: 7,
            id: Some(NodeId::from_bytes([1u8; 32])),
            to: "127.0.0.1:4000".parse().unwrap(),
            kind: RequestKind::User(Command::Lookup),
            target: Some([2u8; 32]),
            value: None,
        });
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(b"hi").is_err());
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_signed_payload_bound_to_command() {
        let kp = KeyPair::generate();
        let body = HolepunchPayload {
            session: 1,
            round: 0,
            phase: PunchPhase::Punch,
            firewall: FirewallClass::Consistent,
            addresses: vec![],
            error: ErrorCode::None,
        };
        let signed = SignedPayload::sign(&kp, Command::PeerHolepunch, &body).unwrap();
        let opened: HolepunchPayload = signed.open(Command::PeerHolepunch).unwrap();
        assert_eq!(opened, body);

        // Replaying the same signature as another command fails.
        let replay: Result<HolepunchPayload, _> = signed.open(Command::PeerHandshake);
        assert!(matches!(replay, Err(MessageError::InvalidSignature)));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let kp = KeyPair::generate();
        let mut signed = SignedPayload::sign(&kp, Command::PeerHandshake, &5u32).unwrap();
        signed.payload[0] ^= 1;
        let opened: Result<u32, _> = signed.open(Command::PeerHandshake);
        assert!(matches!(opened, Err(MessageError::InvalidSignature)));
    }

    #[test]
    fn test_unsigned_command_has_no_signable() {
        assert!(signable(Command::Lookup, &[b"x".as_slice()]).is_err());
    }

    #[test]
    fn test_announce_signature_bound_to_target() {
        let kp = KeyPair::generate();
        let record = PeerRecord {
            public_key: kp.public_key(),
            relay_addresses: vec!["10.0.0.1:1".parse().unwrap()],
        };
        let mut announce = AnnounceRequest::sign(&kp, &[1u8; 32], record, 10).unwrap();
        assert!(announce.verify(&[1u8; 32]).is_ok());
        assert!(announce.verify(&[2u8; 32]).is_err());
        announce.stamp = 11;
        assert!(announce.verify(&[1u8; 32]).is_err());
    }

    #[test]
    fn test_mutable_signature_covers_salt() {
        let kp = KeyPair::generate();
        let mut put = MutablePutRequest::sign(&kp, 3, b"v".to_vec(), Some(b"salt".to_vec())).unwrap();
        assert!(put.verify().is_ok());
        put.salt = None;
        assert!(put.verify().is_err());
    }

    #[test]
    fn test_unannounce_signature() {
        let kp = KeyPair::generate();
        let mut un = UnannounceRequest::sign(&kp, &[9u8; 32], 10).unwrap();
        assert!(un.verify(&[9u8; 32]).is_ok());
        assert!(un.verify(&[8u8; 32]).is_err());
        un.stamp = 9;
        assert!(un.verify(&[9u8; 32]).is_err());
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let a = next_stamp();
        let b = next_stamp();
        assert!(b > a);
        assert!(a + 60_000 > unix_millis());
    }
}
