//! In-memory record store.
//!
//! Holds three kinds of records, all keyed by 32 bytes:
//! - announce records: the peers announced under a topic, newest last;
//! - mutable records: signed values with a sequence number;
//! - immutable records: content-addressed values.
//!
//! ANNOUNCE and UNANNOUNCE carry a signed stamp; the store remembers the
//! newest stamp per (topic, key) and refuses anything not newer, or older
//! than `ttl`.
//!
//! Every record expires `ttl` after its last write. Memory is bounded per key
//! prefix (the first key byte): inserting a new key into a full prefix evicts
//! the oldest key sharing that prefix.

use crate::messages::{ErrorCode, MutablePutRequest, PeerRecord, unix_millis};
use spaceswarm_crypto::{PublicKey, Signature, hash};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How far ahead of the local clock a stamp may run
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Record store limits
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Lifetime of a record after its last write
    pub ttl: Duration,
    /// Largest accepted value
    pub max_value_size: usize,
    /// Keys kept per first-byte prefix
    pub max_records_per_prefix: usize,
    /// Announcers kept per topic
    pub max_announcers: usize,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20 * 60),
            max_value_size: 1000,
            max_records_per_prefix: 2048,
            max_announcers: 20,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Store rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Value exceeds the size cap
    #[error("value too large: {size} bytes (max {max})")]
    ValueTooLarge {
        /// Value size
        size: usize,
        /// Cap
        max: usize,
    },

    /// Immutable key is not the hash of the value
    #[error("key does not match value hash")]
    HashMismatch,

    /// Mutable key is not derived from the signing key and salt
    #[error("key does not match public key and salt")]
    KeyMismatch,

    /// Sequence number below the stored one
    #[error("sequence number too low")]
    SeqTooLow,

    /// Same sequence number with a different value
    #[error("sequence number reused")]
    SeqReused,

    /// Signature does not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Stamp not newer than the last one seen, or outside the accepted window
    #[error("stale or replayed stamp")]
    Stale,
}

impl StoreError {
    /// Response code for this rejection
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SeqTooLow => ErrorCode::SeqTooLow,
            Self::SeqReused => ErrorCode::SeqReused,
            _ => ErrorCode::Aborted,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Key of an immutable value
#[must_use]
pub fn immutable_key(value: &[u8]) -> [u8; 32] {
    hash(value)
}

/// Key of a mutable record
#[must_use]
pub fn mutable_key(public_key: &PublicKey, salt: Option<&[u8]>) -> [u8; 32] {
    match salt {
        Some(salt) => spaceswarm_crypto::hash::hash_batch(&[public_key.as_bytes().as_slice(), salt]),
        None => hash(public_key.as_bytes()),
    }
}

/// Announced peer as kept by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPeer {
    /// Signed record
    pub record: PeerRecord,
    /// Announcer address as observed when the announce arrived
    pub address: SocketAddr,
    stored_at: Instant,
}

/// Stored mutable record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMutable {
    /// Signing key
    pub public_key: PublicKey,
    /// Sequence number
    pub seq: u64,
    /// Value
    pub value: Vec<u8>,
    /// Salt used in the key
    pub salt: Option<Vec<u8>>,
    /// Record signature
    pub signature: Signature,
    stored_at: Instant,
}

#[derive(Debug)]
struct StoredImmutable {
    value: Vec<u8>,
    stored_at: Instant,
}

/// In-memory record store
#[derive(Debug)]
pub struct RecordStore {
    config: StoreConfig,
    announces: HashMap<[u8; 32], VecDeque<StoredPeer>>,
    mutables: HashMap<[u8; 32], StoredMutable>,
    immutables: HashMap<[u8; 32], StoredImmutable>,
    stamps: HashMap<([u8; 32], PublicKey), u64>,
    prefix_counts: Vec<usize>,
}

impl RecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            announces: HashMap::new(),
            mutables: HashMap::new(),
            immutables: HashMap::new(),
            stamps: HashMap::new(),
            prefix_counts: vec![0; 256],
        }
    }

    /// Store limits
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Announces
    // ------------------------------------------------------------------

    /// Upsert an announced peer under `target`.
    ///
    /// A repeated announce from the same key replaces the old entry and
    /// refreshes its expiry. A full topic drops its oldest announcer.
    pub fn announce(&mut self, target: [u8; 32], record: PeerRecord, address: SocketAddr) {
        if !self.announces.contains_key(&target) {
            self.make_room(&target);
            self.prefix_counts[target[0] as usize] += 1;
        }
        let peers = self.announces.entry(target).or_default();
        peers.retain(|p| p.record.public_key != record.public_key);
        while peers.len() >= self.config.max_announcers.max(1) {
            peers.pop_front();
        }
        peers.push_back(StoredPeer {
            record,
            address,
            stored_at: Instant::now(),
        });
    }

    /// Remove `public_key`'s announce under `target`. Returns true if one was removed.
    pub fn unannounce(&mut self, target: &[u8; 32], public_key: &PublicKey) -> bool {
        let Some(peers) = self.announces.get_mut(target) else {
            return false;
        };
        let before = peers.len();
        peers.retain(|p| p.record.public_key != *public_key);
        let removed = peers.len() != before;
        if peers.is_empty() {
            self.announces.remove(target);
            self.release(target);
        }
        removed
    }

    /// Accept `stamp` for `public_key` under `target` and remember it.
    ///
    /// # Errors
    /// [`StoreError::Stale`] if the stamp is not newer than the last accepted
    /// one, is older than the record ttl, or runs too far ahead of our clock.
    pub fn check_stamp(
        &mut self,
        target: [u8; 32],
        public_key: &PublicKey,
        stamp: u64,
    ) -> Result<(), StoreError> {
        let now = unix_millis();
        if stamp.saturating_add(self.ttl_millis()) < now
            || stamp > now.saturating_add(millis(MAX_CLOCK_SKEW))
        {
            return Err(StoreError::Stale);
        }
        let last = self.stamps.entry((target, *public_key)).or_insert(0);
        if stamp <= *last {
            return Err(StoreError::Stale);
        }
        *last = stamp;
        Ok(())
    }

    fn ttl_millis(&self) -> u64 {
        millis(self.config.ttl)
    }

    /// Live announcers under `target`, newest first
    #[must_use]
    pub fn lookup(&self, target: &[u8; 32]) -> Vec<&StoredPeer> {
        let ttl = self.config.ttl;
        self.announces
            .get(target)
            .map(|peers| {
                peers
                    .iter()
                    .rev()
                    .filter(|p| p.stored_at.elapsed() < ttl)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent live announcer under `target`
    #[must_use]
    pub fn find_peer(&self, target: &[u8; 32]) -> Option<&StoredPeer> {
        self.lookup(target).into_iter().next()
    }

    // ------------------------------------------------------------------
    // Mutable records
    // ------------------------------------------------------------------

    /// Store a signed mutable record under `key`.
    ///
    /// # Errors
    /// - [`StoreError::ValueTooLarge`] above the size cap
    /// - [`StoreError::KeyMismatch`] if `key` is not derived from the record key and salt
    /// - [`StoreError::SeqTooLow`] / [`StoreError::SeqReused`] against the stored record
    /// - [`StoreError::InvalidSignature`] if the signature does not verify
    pub fn put_mutable(&mut self, key: [u8; 32], put: MutablePutRequest) -> Result<(), StoreError> {
        self.check_size(put.value.len())?;
        if mutable_key(&put.public_key, put.salt.as_deref()) != key {
            return Err(StoreError::KeyMismatch);
        }
        if let Some(stored) = self.live_mutable(&key) {
            if put.seq < stored.seq {
                return Err(StoreError::SeqTooLow);
            }
            if put.seq == stored.seq && put.value != stored.value {
                return Err(StoreError::SeqReused);
            }
        }
        put.verify().map_err(|_| StoreError::InvalidSignature)?;

        if !self.mutables.contains_key(&key) {
            self.make_room(&key);
            self.prefix_counts[key[0] as usize] += 1;
        }
        self.mutables.insert(
            key,
            StoredMutable {
                public_key: put.public_key,
                seq: put.seq,
                value: put.value,
                salt: put.salt,
                signature: put.signature,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Live mutable record under `key`
    #[must_use]
    pub fn get_mutable(&self, key: &[u8; 32]) -> Option<&StoredMutable> {
        self.live_mutable(key)
    }

    fn live_mutable(&self, key: &[u8; 32]) -> Option<&StoredMutable> {
        self.mutables
            .get(key)
            .filter(|m| m.stored_at.elapsed() < self.config.ttl)
    }

    // ------------------------------------------------------------------
    // Immutable records
    // ------------------------------------------------------------------

    /// Store a content-addressed value. Re-putting the same value only refreshes it.
    ///
    /// # Errors
    /// [`StoreError::ValueTooLarge`] or [`StoreError::HashMismatch`].
    pub fn put_immutable(&mut self, key: [u8; 32], value: Vec<u8>) -> Result<(), StoreError> {
        self.check_size(value.len())?;
        if immutable_key(&value) != key {
            return Err(StoreError::HashMismatch);
        }
        if let Some(existing) = self.immutables.get_mut(&key) {
            existing.stored_at = Instant::now();
            return Ok(());
        }
        self.make_room(&key);
        self.prefix_counts[key[0] as usize] += 1;
        self.immutables.insert(
            key,
            StoredImmutable {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Live immutable value under `key`
    #[must_use]
    pub fn get_immutable(&self, key: &[u8; 32]) -> Option<&[u8]> {
        self.immutables
            .get(key)
            .filter(|v| v.stored_at.elapsed() < self.config.ttl)
            .map(|v| v.value.as_slice())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Drop every expired record. Returns the number of records removed.
    pub fn sweep(&mut self) -> usize {
        let ttl = self.config.ttl;
        let mut removed = 0;
        let mut emptied = Vec::new();

        for (key, peers) in &mut self.announces {
            let before = peers.len();
            peers.retain(|p| p.stored_at.elapsed() < ttl);
            removed += before - peers.len();
            if peers.is_empty() {
                emptied.push(*key);
            }
        }
        for key in &emptied {
            self.announces.remove(key);
        }

        let expired: Vec<_> = self
            .mutables
            .iter()
            .filter(|(_, m)| m.stored_at.elapsed() >= ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.mutables.remove(key);
        }
        removed += expired.len();
        emptied.extend(expired);

        let expired: Vec<_> = self
            .immutables
            .iter()
            .filter(|(_, v)| v.stored_at.elapsed() >= ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.immutables.remove(key);
        }
        removed += expired.len();
        emptied.extend(expired);

        for key in &emptied {
            self.release(key);
        }

        // Anything this old fails the window check anyway.
        let horizon = unix_millis().saturating_sub(self.ttl_millis());
        self.stamps.retain(|_, stamp| *stamp >= horizon);
        removed
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.announces.len() + self.mutables.len() + self.immutables.len()
    }

    /// True if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_size(&self, size: usize) -> Result<(), StoreError> {
        if size > self.config.max_value_size {
            return Err(StoreError::ValueTooLarge {
                size,
                max: self.config.max_value_size,
            });
        }
        Ok(())
    }

    fn release(&mut self, key: &[u8; 32]) {
        let count = &mut self.prefix_counts[key[0] as usize];
        *count = count.saturating_sub(1);
    }

    /// Evict the oldest key sharing `key`'s prefix while that prefix is full.
    fn make_room(&mut self, key: &[u8; 32]) {
        let prefix = key[0];
        while self.prefix_counts[prefix as usize] >= self.config.max_records_per_prefix.max(1) {
            let Some(oldest) = self.oldest_with_prefix(prefix) else {
                break;
            };
            self.announces.remove(&oldest);
            self.mutables.remove(&oldest);
            self.immutables.remove(&oldest);
            self.release(&oldest);
        }
    }

    fn oldest_with_prefix(&self, prefix: u8) -> Option<[u8; 32]> {
        let announces = self.announces.iter().filter_map(|(k, peers)| {
            peers
                .iter()
                .map(|p| p.stored_at)
                .max()
                .map(|at| (*k, at))
        });
        let mutables = self.mutables.iter().map(|(k, m)| (*k, m.stored_at));
        let immutables = self.immutables.iter().map(|(k, v)| (*k, v.stored_at));

        announces
            .chain(mutables)
            .chain(immutables)
            .filter(|(k, _)| k[0] == prefix)
            .min_by_key(|(_, at)| *at)
            .map(|(k, _)| k)
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
