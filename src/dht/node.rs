use super::error::DhtError;
use super::info_hash::InfoHash;
use rand::Rng as _;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

pub(crate) const MAX_FAILURES: u8 = 3;

/// A 160-bit Kademlia node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a random node ID from the thread-local CSPRNG.
    ///
    /// The all-zero ID is reserved and never produced.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut id = [0u8; 20];
        loop {
            rng.fill(&mut id[..]);
            if id != [0u8; 20] {
                return Self(id);
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to another ID, big-endian: byte-wise comparison of the
    /// result orders distances as 160-bit unsigned integers.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Routing bucket for `other`: the position of the leading 1-bit of the
    /// XOR distance, counted from the most significant bit (0..=159).
    ///
    /// An identical ID has no leading 1-bit; callers reject it before
    /// insertion, and the fallback of 159 only matters for that degenerate
    /// input.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        159
    }
}

impl From<InfoHash> for NodeId {
    fn from(hash: InfoHash) -> Self {
        NodeId(hash.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A known DHT node: ID, IPv4 endpoint, and liveness bookkeeping.
///
/// Equality and hashing consider only the ID; a contact reappearing at a new
/// address is the same logical node.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub last_seen: Instant,
    pub failures: u8,
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.0.hash(state);
    }
}

impl Contact {
    /// Creates a contact, rejecting port 0.
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Result<Self, DhtError> {
        if addr.port() == 0 {
            return Err(DhtError::InvalidEndpoint);
        }
        Ok(Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        })
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        self.last_seen.elapsed() > max_age
    }

    /// Parses one 26-byte compact entry: 20 ID + 4 IPv4 + 2 port (big-endian).
    ///
    /// Returns `None` for a wrong-length slice or a zero port.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Self::new(id, SocketAddrV4::new(ip, port)).ok()
    }

    pub fn to_compact(&self) -> [u8; 26] {
        let mut compact = [0u8; 26];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..24].copy_from_slice(&self.addr.ip().octets());
        compact[24..26].copy_from_slice(&self.addr.port().to_be_bytes());
        compact
    }

    /// Sort key used to break exact-distance ties deterministically.
    pub(crate) fn endpoint_key(&self) -> (u32, u16) {
        (u32::from(*self.addr.ip()), self.addr.port())
    }
}
