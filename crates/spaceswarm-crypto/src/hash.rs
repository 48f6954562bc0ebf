//! BLAKE3 hashing and namespaced domain separation.
//!
//! Provides:
//! - `hash`, the 32-byte content hash used for record keys and node ids
//! - `namespace`, which derives one tag per command id from a domain string
//!   so a signature made for one command or network cannot be replayed as another
//! - context-specific key derivation

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Domain string for every signed DHT command.
pub const DHT_NAMESPACE: &str = "spaceswarm/dht";

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Hash several byte slices as one contiguous input.
#[must_use]
pub fn hash_batch(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Derive one domain-separation tag per id.
///
/// `tag[i] = BLAKE3(BLAKE3(domain) || id[i])`. Tags are prepended to signable
/// payloads.
///
/// # Example
///
/// ```
/// use spaceswarm_crypto::hash::namespace;
///
/// let tags = namespace("spaceswarm/dht", &[4, 5]);
/// assert_eq!(tags.len(), 2);
/// assert_ne!(tags[0], tags[1]);
/// ```
#[must_use]
pub fn namespace(domain: &str, ids: &[u8]) -> Vec<HashOutput> {
    let base = hash(domain.as_bytes());
    ids.iter()
        .map(|id| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&base);
            hasher.update(&[*id]);
            *hasher.finalize().as_bytes()
        })
        .collect()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key from input key material.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"world"));
    }

    #[test]
    fn test_hash_batch_matches_concatenation() {
        assert_eq!(hash_batch(&[b"hel", b"lo"]), hash(b"hello"));
    }

    #[test]
    fn test_namespace_tags_distinct() {
        let tags = namespace(DHT_NAMESPACE, &[4, 5, 6, 0, 1]);
        assert_eq!(tags.len(), 5);
        for i in 0..tags.len() {
            for j in (i + 1)..tags.len() {
                assert_ne!(tags[i], tags[j]);
            }
        }
    }

    #[test]
    fn test_namespace_depends_on_domain() {
        let a = namespace("spaceswarm/dht", &[4]);
        let b = namespace("othernet/dht", &[4]);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn test_namespace_stable_per_id() {
        let a = namespace(DHT_NAMESPACE, &[4, 5]);
        let b = namespace(DHT_NAMESPACE, &[5]);
        assert_eq!(a[1], b[0]);
    }

    #[test]
    fn test_kdf_context_separation() {
        let a = Kdf::new("spaceswarm context a").derive_key(b"ikm");
        let b = Kdf::new("spaceswarm context b").derive_key(b"ikm");
        assert_ne!(a, b);
    }
}
