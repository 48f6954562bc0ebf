//! DHT node identity and distance metric.
//!
//! A [`NodeId`] is a 256-bit identifier. Persistent nodes derive theirs from
//! their public key with BLAKE3; ephemeral nodes use a random one that never
//! leaves the process. Distance is bitwise XOR read as a big-endian unsigned
//! integer.

use rand::Rng;
use serde::{Deserialize, Serialize};
use spaceswarm_crypto::PublicKey;
use std::cmp::Ordering;
use std::fmt;

/// 256-bit node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in a NodeId
    pub const BITS: usize = 256;

    /// Generate a random NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use spaceswarm_dht::NodeId;
    ///
    /// assert_ne!(NodeId::random(), NodeId::random());
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive the NodeId of a public key.
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(spaceswarm_crypto::hash(public_key.as_bytes()))
    }

    /// XOR distance to another id
    ///
    /// # Examples
    ///
    /// ```
    /// use spaceswarm_dht::NodeId;
    ///
    /// let a = NodeId::from_bytes([1u8; 32]);
    /// let b = NodeId::from_bytes([2u8; 32]);
    /// assert_eq!(a.distance(&b).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Compare the distances of `a` and `b` to `self`.
    #[must_use]
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Count leading zero bits (0-256)
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    /// Length of the common prefix with `other`, or `None` for identical ids.
    ///
    /// This is the bucket index: bucket 0 holds the far half of the id space,
    /// bucket 255 the single id differing only in the last bit.
    #[must_use]
    pub fn common_prefix_len(&self, other: &NodeId) -> Option<usize> {
        let leading = self.distance(other).leading_zeros();
        if leading == Self::BITS {
            None
        } else {
            Some(leading)
        }
    }

    /// Random id sharing exactly `depth` leading bits with `self`.
    #[must_use]
    pub fn random_at_depth(&self, depth: usize) -> NodeId {
        let mut id = NodeId::random().0;
        let depth = depth.min(Self::BITS - 1);
        for bit in 0..=depth {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let own = self.0[byte] & mask;
            let value = if bit == depth { own ^ mask } else { own };
            id[byte] = (id[byte] & !mask) | value;
        }
        NodeId(id)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceswarm_crypto::KeyPair;

    #[test]
    fn test_node_id_from_public_key() {
        let pk = KeyPair::from_seed([42u8; 32]).public_key();
        assert_eq!(NodeId::from_public_key(&pk), NodeId::from_public_key(&pk));
        assert_eq!(
            NodeId::from_public_key(&pk).as_bytes(),
            &spaceswarm_crypto::hash(pk.as_bytes())
        );
    }

    #[test]
    fn test_xor_distance_symmetry_and_identity() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), NodeId::from_bytes([0u8; 32]));
    }

    #[test]
    fn test_leading_zeros() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b0100_0000;
        assert_eq!(NodeId::from_bytes(bytes).leading_zeros(), 1);

        let mut bytes = [0u8; 32];
        bytes[1] = 0b1000_0000;
        assert_eq!(NodeId::from_bytes(bytes).leading_zeros(), 8);

        assert_eq!(NodeId::from_bytes([0u8; 32]).leading_zeros(), 256);
    }

    #[test]
    fn test_common_prefix_len() {
        let local = NodeId::from_bytes([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        assert_eq!(NodeId::from_bytes(bytes).common_prefix_len(&local), Some(0));

        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        assert_eq!(NodeId::from_bytes(bytes).common_prefix_len(&local), Some(255));

        assert_eq!(local.common_prefix_len(&local), None);
    }

    #[test]
    fn test_random_at_depth() {
        let local = NodeId::random();
        for depth in [0, 1, 7, 8, 100, 255] {
            let id = local.random_at_depth(depth);
            assert_eq!(id.common_prefix_len(&local), Some(depth));
        }
    }

    #[test]
    fn test_cmp_distance() {
        let target = NodeId::from_bytes([0u8; 32]);
        let near = NodeId::from_bytes([1u8; 32]);
        let far = NodeId::from_bytes([0xffu8; 32]);
        assert_eq!(target.cmp_distance(&near, &far), Ordering::Less);
    }

    #[test]
    fn test_debug_display() {
        let mut bytes = [0u8; 32];
        bytes[..3].copy_from_slice(&[0xab, 0xcd, 0xef]);
        let id = NodeId::from_bytes(bytes);
        assert!(format!("{id:?}").contains("abcdef"));
        assert_eq!(format!("{id}").len(), 16);
    }
}
