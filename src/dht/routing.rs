use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::Duration;

use parking_lot::RwLock;

use super::error::DhtError;
use super::node::{Contact, NodeId};

pub const DEFAULT_K: usize = 8;
const MAX_K: usize = 100;
const NUM_BUCKETS: usize = 160;
const MAX_CLOSEST: usize = 1000;

/// Result of a routing-table insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The ID was already present; its entry was refreshed and moved to the
    /// most-recently-seen position.
    Updated,
    /// Appended to a bucket with room to spare.
    Inserted,
    /// The bucket is full. The newcomer was queued as a replacement and the
    /// named least-recently-seen contact should be pinged; it is evicted only
    /// once its failure count crosses the threshold.
    Deferred { probe: Contact },
    /// Own ID, or an endpoint already registered under a different ID.
    Ignored,
}

#[derive(Debug)]
struct Bucket {
    contacts: VecDeque<Contact>,
    replacements: VecDeque<Contact>,
}

impl Bucket {
    fn new(k: usize) -> Self {
        Self {
            contacts: VecDeque::with_capacity(k),
            replacements: VecDeque::with_capacity(k),
        }
    }

    fn insert(&mut self, contact: Contact, k: usize) -> InsertOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self.contacts.remove(pos).unwrap();
            existing.addr = contact.addr;
            existing.touch();
            self.contacts.push_back(existing);
            return InsertOutcome::Updated;
        }

        if self.contacts.len() < k {
            self.contacts.push_back(contact);
            return InsertOutcome::Inserted;
        }

        if !self.replacements.iter().any(|c| c.id == contact.id) {
            if self.replacements.len() >= k {
                self.replacements.pop_front();
            }
            self.replacements.push_back(contact);
        }

        let probe = self.contacts.front().unwrap().clone();
        InsertOutcome::Deferred { probe }
    }

    fn remove(&mut self, id: &NodeId, k: usize) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        let removed = self.contacts.remove(pos);
        self.promote(k);
        removed
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| &c.id == id)
    }

    fn promote(&mut self, k: usize) {
        while self.contacts.len() < k {
            match self.replacements.pop_front() {
                Some(c) => self.contacts.push_back(c),
                None => break,
            }
        }
    }
}

/// K-bucket routing table: 160 buckets keyed by the XOR-prefix distance from
/// our own ID.
///
/// Guarantees: no duplicate IDs, never our own ID, each contact in exactly
/// one bucket, no bucket beyond K entries. A full bucket defers to the ping
/// discipline rather than evicting on sight (see [`InsertOutcome::Deferred`]).
pub struct RoutingTable {
    own_id: NodeId,
    k: usize,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        Self::with_k(own_id, DEFAULT_K).unwrap()
    }

    /// Creates a table with a custom bucket capacity in `1..=100`.
    pub fn with_k(own_id: NodeId, k: usize) -> Result<Self, DhtError> {
        if k == 0 || k > MAX_K {
            return Err(DhtError::InvalidBucketSize(k));
        }
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(Bucket::new(k)))
            .collect();
        Ok(Self { own_id, k, buckets })
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn insert(&self, contact: Contact) -> InsertOutcome {
        if contact.id == self.own_id {
            return InsertOutcome::Ignored;
        }
        if let Some(existing) = self.find_by_addr(&contact.addr) {
            if existing.id != contact.id {
                return InsertOutcome::Ignored;
            }
        }

        let idx = self.own_id.bucket_index(&contact.id);
        self.buckets[idx].write().insert(contact, self.k)
    }

    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        if id == &self.own_id {
            return None;
        }
        let idx = self.own_id.bucket_index(id);
        self.buckets[idx].write().remove(id, self.k)
    }

    /// Records a query failure; the contact is evicted (and a queued
    /// replacement promoted) once it accumulates enough failures.
    pub fn mark_failed(&self, id: &NodeId) {
        if id == &self.own_id {
            return;
        }
        let idx = self.own_id.bucket_index(id);
        let mut bucket = self.buckets[idx].write();

        if let Some(contact) = bucket.get_mut(id) {
            contact.fail();
            if contact.is_bad() {
                bucket.remove(id, self.k);
            }
        }
    }

    /// The `n` contacts closest to `target`, ascending by XOR distance.
    ///
    /// Exact-distance ties break on `(ip, port)` so the result is
    /// deterministic. `n` is capped at 1000.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let n = n.min(MAX_CLOSEST);
        let mut contacts: Vec<(Contact, [u8; 20])> = Vec::new();

        for bucket in &self.buckets {
            let bucket = bucket.read();
            for contact in &bucket.contacts {
                let dist = contact.id.distance(target);
                contacts.push((contact.clone(), dist));
            }
        }

        contacts.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| a.0.endpoint_key().cmp(&b.0.endpoint_key()))
        });
        contacts.truncate(n);
        contacts.into_iter().map(|(c, _)| c).collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        if id == &self.own_id {
            return None;
        }
        let idx = self.own_id.bucket_index(id);
        let bucket = self.buckets[idx].read();
        bucket.contacts.iter().find(|c| &c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops contacts (and queued replacements) unseen for longer than
    /// `max_age`, promoting replacements into the freed slots.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut evicted = 0;

        for bucket in &self.buckets {
            let mut bucket = bucket.write();
            let before = bucket.contacts.len();
            bucket.contacts.retain(|c| !c.is_stale(max_age));
            evicted += before - bucket.contacts.len();
            bucket.replacements.retain(|c| !c.is_stale(max_age));
            bucket.promote(self.k);
        }

        evicted
    }

    fn find_by_addr(&self, addr: &SocketAddrV4) -> Option<Contact> {
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for contact in bucket.contacts.iter().chain(bucket.replacements.iter()) {
                if &contact.addr == addr {
                    return Some(contact.clone());
                }
            }
        }
        None
    }
}
