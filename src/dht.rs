//! BitTorrent Mainline DHT ([BEP-5]) with infohash indexing ([BEP-51]).
//!
//! The engine participates in the Kademlia-based DHT in two ways: as a
//! scraper that locates peers for a specific torrent, and as a crawler that
//! answers other participants' traffic to observe which info_hashes the
//! network is searching for.
//!
//! # Getting started
//!
//! ```no_run
//! use std::time::Duration;
//! use dhtscout::dht::{CancelFlag, DhtEngine, EngineConfig, InfoHash};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dht = DhtEngine::bind(EngineConfig::default()).await?;
//! dht.bootstrap().await?;
//!
//! let info_hash = InfoHash::from_hex("c12fe1c06bba254a9dc9f519b335aa7c1367a88a")?;
//! let cancel = CancelFlag::new();
//! let peers = dht
//!     .scrape_peers(info_hash, Duration::from_secs(15), &cancel)
//!     .await;
//!
//! for peer in peers {
//!     println!("found peer: {}", peer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`DhtEngine`] - UDP socket, transaction registry, scrape and crawl loops
//! - [`RoutingTable`] - 160 K-buckets keyed by XOR-prefix distance
//! - [`Message`] - BEP 5 / BEP 51 wire messages over bencode
//! - [`NodeId`] / [`Contact`] - 160-bit identities and IPv4 endpoints
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-51]: http://bittorrent.org/beps/bep_0051.html

mod engine;
mod error;
mod info_hash;
mod lookup;
mod message;
mod node;
mod routing;

pub use engine::{
    CancelFlag, CrawlReport, CrawlStats, DhtEngine, DiscoveredInfoHash, Discovery,
    DiscoveryOrigin, EngineConfig, BOOTSTRAP_NODES,
};
pub use error::DhtError;
pub use info_hash::InfoHash;
pub use message::{
    pack_nodes, unpack_nodes, unpack_samples, ErrorMessage, Message, Query, QueryMessage,
    ResponseBody, ResponseMessage, TransactionId, ERR_GENERIC, ERR_METHOD_UNKNOWN, ERR_PROTOCOL,
    ERR_SERVER, MAX_SAMPLES,
};
pub use node::{Contact, NodeId};
pub use routing::{InsertOutcome, RoutingTable, DEFAULT_K};

#[cfg(test)]
mod tests;
