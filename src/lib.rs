//! dhtscout - BitTorrent Mainline DHT scraper and crawler
//!
//! This library participates in the Kademlia-based DHT ([BEP-5]) used by
//! BitTorrent for trackerless peer discovery. It operates in two modes built
//! on one engine:
//!
//! - **Scraper** - iterative `get_peers` lookups locate peers for a torrent
//!   identified by its 20-byte info hash.
//! - **Crawler** - the node joins the DHT, answers inbound traffic, and
//!   observes which info hashes other participants search for or index
//!   ([BEP-51] `sample_infohashes`).
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`dht`] - the DHT engine: routing table, wire protocol, lookups, crawl loop
//! - [`progress`] - formatting helpers for the progress callback
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-51]: http://bittorrent.org/beps/bep_0051.html

pub mod bencode;
pub mod dht;
pub mod progress;

pub use bencode::{decode, decode_prefix, encode, BencodeError, Value};
pub use dht::{
    CancelFlag, Contact, CrawlReport, CrawlStats, DhtEngine, DhtError, DiscoveryOrigin,
    EngineConfig, InfoHash, Message, NodeId, RoutingTable,
};
