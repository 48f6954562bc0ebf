//! K-bucket routing table.
//!
//! One bucket per common-prefix length with the local id. Bucket `i` holds
//! contacts sharing exactly `i` leading bits with us, so the buckets along the
//! path to the local id are fine-grained while distant ones stay coarse.
//! Pure data structure: no I/O, no locking.

use crate::node_id::NodeId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Default bucket capacity
pub const K: usize = 20;

/// Number of buckets
pub const NUM_BUCKETS: usize = NodeId::BITS;

/// Timeouts after which a contact is dropped
pub const MAX_FAILURES: u8 = 2;

/// A contact not heard from in this long may be replaced by a fresh one
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// A known DHT node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Node id
    pub id: NodeId,
    /// Reachable address
    pub addr: SocketAddr,
    /// Last time the node answered or contacted us
    pub last_seen: Instant,
    /// Most recent round-trip time
    pub rtt: Option<Duration>,
    /// Consecutive request timeouts
    pub failures: u8,
}

impl Contact {
    /// New contact seen now
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            rtt: None,
            failures: 0,
        }
    }

    fn is_replaceable(&self) -> bool {
        self.failures > 0 || self.last_seen.elapsed() >= STALE_AFTER
    }
}

/// Outcome of [`RoutingTable::insert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New contact added
    Added,
    /// Existing contact refreshed
    Updated,
    /// Least-recently-seen contact replaced by the new one
    Replaced(NodeId),
    /// Bucket full of live contacts; the newcomer waits as a replacement
    Full {
        /// Least-recently-seen contact of the bucket, worth pinging
        oldest: NodeId,
    },
    /// The local id is never stored
    Ignored,
}

#[derive(Debug, Default)]
struct KBucket {
    // Ordered least- to most-recently seen.
    contacts: Vec<Contact>,
    replacement: Option<Contact>,
}

impl KBucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn insert(&mut self, mut contact: Contact, capacity: usize) -> InsertOutcome {
        if self.replacement.as_ref().is_some_and(|r| r.id == contact.id) {
            self.replacement = None;
        }
        if let Some(pos) = self.position(&contact.id) {
            let existing = self.contacts.remove(pos);
            if contact.rtt.is_none() {
                contact.rtt = existing.rtt;
            }
            self.contacts.push(contact);
            return InsertOutcome::Updated;
        }

        if self.contacts.len() < capacity {
            self.contacts.push(contact);
            return InsertOutcome::Added;
        }

        if self.contacts.first().is_some_and(Contact::is_replaceable) {
            let evicted = self.contacts.remove(0);
            self.contacts.push(contact);
            return InsertOutcome::Replaced(evicted.id);
        }

        let oldest = self.contacts.first().map(|c| c.id);
        self.replacement = Some(contact);
        match oldest {
            Some(oldest) => InsertOutcome::Full { oldest },
            None => InsertOutcome::Ignored,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.position(id)?;
        let removed = self.contacts.remove(pos);
        if let Some(replacement) = self.replacement.take() {
            if self.position(&replacement.id).is_none() {
                self.contacts.push(replacement);
            }
        }
        Some(removed)
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    capacity: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty table with bucket capacity `k`
    #[must_use]
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, KBucket::default);
        Self {
            local_id,
            capacity: k.max(1),
            buckets,
        }
    }

    /// Local node id
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket capacity
    #[must_use]
    pub fn k(&self) -> usize {
        self.capacity
    }

    /// Insert or refresh a contact.
    ///
    /// A full bucket replaces its least-recently-seen contact only when that
    /// contact is stale or has timed out; otherwise the newcomer is kept as the
    /// bucket's replacement.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        let Some(index) = self.local_id.common_prefix_len(&contact.id) else {
            return InsertOutcome::Ignored;
        };
        let capacity = self.capacity;
        self.buckets[index].insert(contact, capacity)
    }

    /// Remove a contact, promoting the bucket's replacement if any
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.local_id.common_prefix_len(id)?;
        self.buckets[index].remove(id)
    }

    /// Look up a contact
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let index = self.local_id.common_prefix_len(id)?;
        self.buckets[index].contacts.iter().find(|c| &c.id == id)
    }

    /// Record a successful exchange with `id`
    pub fn mark_seen(&mut self, id: &NodeId, rtt: Option<Duration>) {
        let Some(index) = self.local_id.common_prefix_len(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.position(id) {
            let mut contact = bucket.contacts.remove(pos);
            contact.last_seen = Instant::now();
            contact.failures = 0;
            if rtt.is_some() {
                contact.rtt = rtt;
            }
            bucket.contacts.push(contact);
        }
    }

    /// Record a timeout. Returns `true` if the contact was dropped.
    pub fn record_failure(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.local_id.common_prefix_len(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        bucket.contacts[pos].failures += 1;
        if bucket.contacts[pos].failures >= MAX_FAILURES {
            bucket.remove(id);
            return true;
        }
        false
    }

    /// Up to `k` contacts ordered by ascending XOR distance to `target`.
    ///
    /// Equal distances (the same id) prefer the most recently seen entry.
    #[must_use]
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        let mut all: Vec<&Contact> = self.buckets.iter().flat_map(|b| &b.contacts).collect();
        all.sort_by(|a, b| {
            target
                .cmp_distance(&a.id, &b.id)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        all.into_iter().take(k).cloned().collect()
    }

    /// A random contact from the bucket at `depth`, or from the nearest
    /// non-empty bucket further out.
    #[must_use]
    pub fn pick_random(&self, depth: usize) -> Option<Contact> {
        use rand::seq::SliceRandom;

        let start = depth.min(NUM_BUCKETS - 1);
        (0..=start)
            .rev()
            .map(|i| &self.buckets[i].contacts)
            .find(|contacts| !contacts.is_empty())
            .and_then(|contacts| contacts.choose(&mut rand::thread_rng()))
            .cloned()
    }

    /// Index of the deepest non-empty bucket
    #[must_use]
    pub fn depth(&self) -> usize {
        self.buckets
            .iter()
            .rposition(|b| !b.contacts.is_empty())
            .unwrap_or(0)
    }

    /// All contacts
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| &b.contacts)
    }

    /// Total number of contacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    /// True when no contact is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn id_with_first_byte(byte: u8, tail: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        bytes[31] = tail;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 32]), K);
        let id = NodeId::random();
        assert_eq!(table.insert(Contact::new(id, addr(1))), InsertOutcome::Added);
        assert_eq!(table.insert(Contact::new(id, addr(2))), InsertOutcome::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).map(|c| c.addr), Some(addr(2)));
    }

    #[test]
    fn test_local_id_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, K);
        assert_eq!(table.insert(Contact::new(local, addr(1))), InsertOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_bucket_keeps_live_contacts() {
        let local = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(local, 2);
        // All share zero prefix bits with the local id: bucket 0.
        let a = id_with_first_byte(0x80, 1);
        let b = id_with_first_byte(0x80, 2);
        let c = id_with_first_byte(0x80, 3);
        table.insert(Contact::new(a, addr(1)));
        table.insert(Contact::new(b, addr(2)));

        assert_eq!(
            table.insert(Contact::new(c, addr(3))),
            InsertOutcome::Full { oldest: a }
        );
        assert!(table.get(&c).is_none());

        // Dropping the oldest promotes the waiting replacement.
        table.remove(&a);
        assert!(table.get(&c).is_some());
    }

    #[test]
    fn test_failed_contact_replaced() {
        let local = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(local, 2);
        let a = id_with_first_byte(0x80, 1);
        let b = id_with_first_byte(0x80, 2);
        let c = id_with_first_byte(0x80, 3);
        table.insert(Contact::new(a, addr(1)));
        table.insert(Contact::new(b, addr(2)));
        assert!(!table.record_failure(&a));

        assert_eq!(
            table.insert(Contact::new(c, addr(3))),
            InsertOutcome::Replaced(a)
        );
    }

    #[test]
    fn test_replacement_admitted_directly_not_promoted_twice() {
        let local = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(local, 2);
        let a = id_with_first_byte(0x80, 1);
        let b = id_with_first_byte(0x80, 2);
        let c = id_with_first_byte(0x80, 3);
        table.insert(Contact::new(a, addr(1)));
        table.insert(Contact::new(b, addr(2)));
        assert_eq!(
            table.insert(Contact::new(c, addr(3))),
            InsertOutcome::Full { oldest: a }
        );

        table.record_failure(&a);
        assert_eq!(
            table.insert(Contact::new(c, addr(3))),
            InsertOutcome::Replaced(a)
        );
        table.remove(&b);

        let ids: Vec<_> = table.contacts().map(|c| c.id).collect();
        assert_eq!(ids, vec![c]);
    }

    #[test]
    fn test_two_failures_evict() {
        let mut table = RoutingTable::new(NodeId::random(), K);
        let id = NodeId::random();
        table.insert(Contact::new(id, addr(1)));
        assert!(!table.record_failure(&id));
        assert!(table.record_failure(&id));
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn test_mark_seen_resets_failures() {
        let mut table = RoutingTable::new(NodeId::random(), K);
        let id = NodeId::random();
        table.insert(Contact::new(id, addr(1)));
        table.record_failure(&id);
        table.mark_seen(&id, Some(Duration::from_millis(5)));
        let contact = table.get(&id).unwrap();
        assert_eq!(contact.failures, 0);
        assert_eq!(contact.rtt, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_pick_random_falls_back_outward() {
        let local = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(local, K);
        assert!(table.pick_random(10).is_none());
        let far = id_with_first_byte(0x80, 1);
        table.insert(Contact::new(far, addr(1)));
        assert_eq!(table.pick_random(10).map(|c| c.id), Some(far));
        assert_eq!(table.depth(), 0);
    }

    proptest! {
        #[test]
        fn prop_closest_sorted_unique_bounded(
            ids in prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..120),
            target in prop::array::uniform32(any::<u8>()),
            k in 0usize..40,
        ) {
            let mut table = RoutingTable::new(NodeId::from_bytes([7u8; 32]), K);
            for (i, bytes) in ids.iter().enumerate() {
                table.insert(Contact::new(NodeId::from_bytes(*bytes), addr(i as u16)));
            }
            let target = NodeId::from_bytes(target);
            let closest = table.closest(&target, k);

            prop_assert!(closest.len() <= k);
            let unique: HashSet<_> = closest.iter().map(|c| c.id).collect();
            prop_assert_eq!(unique.len(), closest.len());
            for pair in closest.windows(2) {
                prop_assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
            }
        }

        #[test]
        fn prop_no_duplicate_ids(
            ids in prop::collection::vec(prop::array::uniform32(0u8..4), 1..60),
        ) {
            let mut table = RoutingTable::new(NodeId::random(), 4);
            for (i, bytes) in ids.iter().enumerate() {
                table.insert(Contact::new(NodeId::from_bytes(*bytes), addr(i as u16)));
            }
            let all: Vec<_> = table.contacts().map(|c| c.id).collect();
            let unique: HashSet<_> = all.iter().collect();
            prop_assert_eq!(unique.len(), all.len());
        }

        #[test]
        fn prop_no_duplicates_under_churn(
            ops in prop::collection::vec((0u8..3, 0u8..6), 1..80),
        ) {
            let local = NodeId::from_bytes([0u8; 32]);
            let mut table = RoutingTable::new(local, 2);
            for (op, tail) in ops {
                let id = id_with_first_byte(0x80, tail);
                match op {
                    0 => {
                        table.insert(Contact::new(id, addr(u16::from(tail))));
                    }
                    1 => {
                        table.record_failure(&id);
                    }
                    _ => {
                        table.remove(&id);
                    }
                }
                let all: Vec<_> = table.contacts().map(|c| c.id).collect();
                let unique: HashSet<_> = all.iter().collect();
                prop_assert_eq!(unique.len(), all.len());
                prop_assert!(all.len() <= 2);
            }
        }
    }
}
