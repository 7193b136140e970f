use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

use bytes::Bytes;

use super::info_hash::InfoHash;
use super::node::{Contact, NodeId};

/// Concurrency factor: candidates queried per lookup round.
pub(crate) const ALPHA: usize = 8;

/// State of one iterative `get_peers` lookup.
///
/// Tracks the distance-ordered unqueried candidate set, the set of IDs
/// already queried, accumulated peers in first-appearance order, and whether
/// the current round has produced a node strictly closer than anything seen
/// before (the no-progress termination rule).
pub(crate) struct LookupState {
    target: [u8; 20],
    candidates: Vec<Contact>,
    queried: HashSet<NodeId>,
    peers: Vec<SocketAddrV4>,
    seen_peers: HashSet<SocketAddrV4>,
    // Tokens are kept so responses validate whole; nothing is announced.
    tokens: HashMap<NodeId, Bytes>,
    best: Option<[u8; 20]>,
    improved: bool,
}

impl LookupState {
    pub(crate) fn new(target: InfoHash, seed: Vec<Contact>) -> Self {
        let mut state = Self {
            target: target.0,
            candidates: Vec::new(),
            queried: HashSet::new(),
            peers: Vec::new(),
            seen_peers: HashSet::new(),
            tokens: HashMap::new(),
            best: None,
            improved: false,
        };
        for contact in seed {
            state.add_candidate(contact);
        }
        // Seeds establish the baseline; only nodes learned later count as
        // progress.
        state.improved = false;
        state
    }

    fn distance_to(&self, id: &NodeId) -> [u8; 20] {
        NodeId(self.target).distance(id)
    }

    pub(crate) fn begin_round(&mut self) {
        self.improved = false;
    }

    pub(crate) fn round_improved(&self) -> bool {
        self.improved
    }

    /// Takes up to `n` closest unqueried candidates and marks them queried.
    pub(crate) fn next_batch(&mut self, n: usize) -> Vec<Contact> {
        let n = n.min(self.candidates.len());
        let batch: Vec<Contact> = self.candidates.drain(..n).collect();
        for contact in &batch {
            self.queried.insert(contact.id);
        }
        batch
    }

    /// Adds a candidate unless it was already queried or is already waiting.
    pub(crate) fn add_candidate(&mut self, contact: Contact) {
        if self.queried.contains(&contact.id)
            || self.candidates.iter().any(|c| c.id == contact.id)
        {
            return;
        }

        let dist = self.distance_to(&contact.id);
        if self.best.map(|best| dist < best).unwrap_or(true) {
            self.best = Some(dist);
            self.improved = true;
        }

        let target = NodeId(self.target);
        let pos = self
            .candidates
            .partition_point(|c| target.distance(&c.id) <= dist);
        self.candidates.insert(pos, contact);
    }

    /// Appends peers, deduplicated, preserving first-appearance order.
    pub(crate) fn add_peers(&mut self, peers: impl IntoIterator<Item = SocketAddrV4>) {
        for peer in peers {
            if self.seen_peers.insert(peer) {
                self.peers.push(peer);
            }
        }
    }

    pub(crate) fn add_token(&mut self, id: NodeId, token: Bytes) {
        self.tokens.insert(id, token);
    }

    pub(crate) fn into_peers(self) -> Vec<SocketAddrV4> {
        self.peers
    }
}
