use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::seq::IteratorRandom as _;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::info_hash::InfoHash;
use super::lookup::{LookupState, ALPHA};
use super::message::{
    Message, Query, QueryMessage, ResponseBody, ResponseMessage, TransactionId,
    ERR_METHOD_UNKNOWN, ERR_PROTOCOL, MAX_SAMPLES,
};
use super::node::{Contact, NodeId};
use super::routing::{InsertOutcome, RoutingTable, DEFAULT_K};
use crate::bencode;

/// Mainline DHT bootstrap endpoints.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 2048;
const RECV_STEP: Duration = Duration::from_millis(100);
const TICK: Duration = Duration::from_secs(1);
const BURST_SIZE: usize = 5;
const REAP_TICKS: u64 = 30;
const STALE_CONTACT_AGE: Duration = Duration::from_secs(15 * 60);
const CLOSEST_REPLY: usize = 8;
const SAMPLE_INTERVAL: i64 = 21600;
const BOOTSTRAP_WAIT: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag shared between the engine loops and a
/// signal handler. Loops check it once per tick or lookup round and return
/// partial results.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine configuration; `Default` matches mainline deployment practice.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// UDP bind port; an ephemeral port is tried when this one is taken.
    pub port: u16,
    /// Bootstrap endpoints as `host:port` strings.
    pub bootstrap: Vec<String>,
    /// Routing-table bucket capacity.
    pub k: usize,
    /// Ingest BEP 51 `samples` carried on inbound responses.
    pub bep51: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 6881,
            bootstrap: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            k: DEFAULT_K,
            bep51: true,
        }
    }
}

/// How an info_hash first reached the discovery store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOrigin {
    /// Seen as the subject of an inbound `get_peers` query.
    GetPeers,
    /// Carried in a BEP 51 `samples` field.
    Bep51,
}

impl fmt::Display for DiscoveryOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryOrigin::GetPeers => write!(f, "get_peers"),
            DiscoveryOrigin::Bep51 => write!(f, "bep51"),
        }
    }
}

/// A first sighting of an info_hash, delivered to the discovery callback.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub info_hash: InfoHash,
    pub source: SocketAddrV4,
    pub origin: DiscoveryOrigin,
}

/// Per-tick crawl counters passed to the progress callback.
#[derive(Debug, Clone)]
pub struct CrawlStats {
    pub elapsed: Duration,
    pub unique_info_hashes: usize,
    pub per_minute: f64,
    pub total_requests: u64,
    pub table_size: usize,
    pub samples_sent: u64,
    pub samples_received: u64,
}

/// Aggregated crawl result.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub elapsed: Duration,
    /// Discovered info hashes, most-requested first.
    pub discovered: Vec<DiscoveredInfoHash>,
    pub total_requests: u64,
    pub samples_sent: u64,
    pub samples_received: u64,
    pub parse_errors: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveredInfoHash {
    pub info_hash: InfoHash,
    /// Inbound `get_peers` requests observed for this hash.
    pub requests: u64,
    /// Distinct endpoints that surfaced it.
    pub sources: usize,
    pub origin: DiscoveryOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    SampleInfohashes,
}

struct PendingQuery {
    kind: QueryKind,
    target: Option<[u8; 20]>,
    dest: SocketAddr,
    dest_id: Option<NodeId>,
    deadline: Instant,
}

struct MatchedResponse {
    tid: TransactionId,
    kind: QueryKind,
    target: Option<[u8; 20]>,
    body: ResponseBody,
}

struct DiscoveredEntry {
    requests: u64,
    sources: HashSet<SocketAddrV4>,
    origin: DiscoveryOrigin,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    samples_sent: u64,
    samples_received: u64,
    malformed: u64,
    mismatched: u64,
}

/// The DHT engine: one UDP socket, a routing table, an in-flight transaction
/// registry, and the scrape/crawl drivers built on them.
///
/// All mutable state is owned here and mutated from the caller's task; the
/// suspension points are the socket receive (100 ms deadline), the 1 Hz tick,
/// and callback invocations.
pub struct DhtEngine {
    socket: UdpSocket,
    local_id: NodeId,
    port: u16,
    config: EngineConfig,
    table: RoutingTable,
    pending: HashMap<TransactionId, PendingQuery>,
    token_secret: [u8; 16],
    discovered: HashMap<InfoHash, DiscoveredEntry>,
    events: Vec<Discovery>,
    counters: Counters,
}

impl DhtEngine {
    /// Binds the UDP socket and generates this node's identity.
    ///
    /// When the configured port is taken the engine falls back to an
    /// OS-chosen port; [`DhtError::Bind`] is returned only when that fails
    /// too.
    pub async fn bind(config: EngineConfig) -> Result<Self, DhtError> {
        let socket = match UdpSocket::bind(("0.0.0.0", config.port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    port = config.port,
                    error = %e,
                    "bind failed, falling back to an ephemeral port"
                );
                UdpSocket::bind(("0.0.0.0", 0))
                    .await
                    .map_err(|source| DhtError::Bind {
                        port: config.port,
                        source,
                    })?
            }
        };

        let port = socket.local_addr()?.port();
        let local_id = NodeId::generate();
        let table = RoutingTable::with_k(local_id, config.k)?;

        info!(%local_id, port, "dht engine bound");

        Ok(Self {
            socket,
            local_id,
            port,
            config,
            table,
            pending: HashMap::new(),
            token_secret: rand::random(),
            discovered: HashMap::new(),
            events: Vec::new(),
            counters: Counters::default(),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    /// Sends `find_node(own_id)` to the configured bootstrap endpoints and
    /// absorbs the replies into the routing table.
    ///
    /// Returns the routing-table size afterwards. Fails only when no
    /// bootstrap query could be sent at all.
    pub async fn bootstrap(&mut self) -> Result<usize, DhtError> {
        let endpoints = self.config.bootstrap.clone();
        let mut sent = 0;

        for endpoint in &endpoints {
            match tokio::net::lookup_host(endpoint.as_str()).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                        debug!(%addr, "bootstrapping");
                        if self
                            .send_query(QueryKind::FindNode, addr, None, |tid, id| {
                                Message::find_node(tid, id, id)
                            })
                            .await
                            .is_some()
                        {
                            sent += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(endpoint = endpoint.as_str(), error = %e, "failed to resolve bootstrap node");
                }
            }
        }

        if sent == 0 {
            return Err(DhtError::BootstrapFailed);
        }

        let deadline = Instant::now() + BOOTSTRAP_WAIT;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(RECV_STEP);
            self.recv_step(wait).await;
        }
        self.reap_transactions();

        info!(nodes = self.table.len(), "bootstrap complete");
        Ok(self.table.len())
    }

    /// Iterative `get_peers` lookup for one info_hash.
    ///
    /// Per round, up to α = 8 unqueried candidates closest to the target are
    /// queried; learned nodes widen the candidate set. The lookup ends when a
    /// round yields no node strictly closer than the best seen, the timeout
    /// elapses, the candidate set runs dry, or the flag is cancelled. Peers
    /// are returned deduplicated in first-appearance order.
    pub async fn scrape_peers(
        &mut self,
        info_hash: InfoHash,
        overall_timeout: Duration,
        cancel: &CancelFlag,
    ) -> Vec<SocketAddrV4> {
        let overall_deadline = Instant::now() + overall_timeout;
        let seed = self.table.closest_nodes(&NodeId::from(info_hash), ALPHA);
        let mut lookup = LookupState::new(info_hash, seed);

        loop {
            if cancel.is_cancelled() || Instant::now() >= overall_deadline {
                break;
            }

            lookup.begin_round();
            let batch = lookup.next_batch(ALPHA);
            if batch.is_empty() {
                break;
            }

            let mut round: HashSet<TransactionId> = HashSet::new();
            for contact in &batch {
                let sent = self
                    .send_query(
                        QueryKind::GetPeers,
                        SocketAddr::V4(contact.addr),
                        Some(contact.id),
                        |tid, id| Message::get_peers(tid, id, info_hash),
                    )
                    .await;
                if let Some(tid) = sent {
                    round.insert(tid);
                }
            }

            let round_deadline = (Instant::now() + QUERY_TIMEOUT).min(overall_deadline);
            while !round.is_empty() && !cancel.is_cancelled() {
                let now = Instant::now();
                if now >= round_deadline {
                    break;
                }
                let wait = (round_deadline - now).min(RECV_STEP);
                if let Some(resp) = self.recv_step(wait).await {
                    if !round.remove(&resp.tid) {
                        continue;
                    }
                    if resp.kind != QueryKind::GetPeers
                        || resp.target != Some(*info_hash.as_bytes())
                    {
                        continue;
                    }
                    lookup.add_peers(resp.body.peers);
                    if let Some(token) = resp.body.token {
                        lookup.add_token(resp.body.id, token);
                    }
                    for node in resp.body.nodes {
                        lookup.add_candidate(node);
                    }
                }
            }
            self.reap_transactions();

            if !lookup.round_improved() {
                // A whole round brought nothing closer; further rounds would
                // re-tread the same neighborhood.
                break;
            }
        }

        self.events.clear();
        lookup.into_peers()
    }

    /// Crawls the network, answering inbound traffic and observing which
    /// info_hashes other participants look for.
    ///
    /// Runs for `duration` (zero = until cancelled) at a 1 Hz tick. Every
    /// `query_interval` ticks a burst of 5 `find_node(random)` queries keeps
    /// the node visible; every 30 ticks stale transactions and contacts are
    /// reaped. `on_discovery` fires once per new info_hash in observation
    /// order; `on_progress` fires once per tick after inbound processing.
    pub async fn crawl<F, G>(
        &mut self,
        duration: Duration,
        query_interval: u64,
        cancel: &CancelFlag,
        mut on_discovery: F,
        mut on_progress: G,
    ) -> CrawlReport
    where
        F: FnMut(&Discovery),
        G: FnMut(&CrawlStats),
    {
        let query_interval = query_interval.max(1);
        let total_ticks = duration.as_secs();
        let started = Instant::now();
        let mut next_tick = started + TICK;
        let mut tick: u64 = 0;

        info!(
            duration_secs = total_ticks,
            query_interval, "crawl started"
        );

        loop {
            // Inbound until the tick boundary.
            loop {
                let now = Instant::now();
                if now >= next_tick || cancel.is_cancelled() {
                    break;
                }
                let wait = (next_tick - now).min(RECV_STEP);
                self.recv_step(wait).await;
            }
            if cancel.is_cancelled() {
                break;
            }

            tick += 1;
            next_tick += TICK;

            if tick % query_interval == 0 {
                self.active_burst().await;
            }
            if tick % REAP_TICKS == 0 {
                self.reap_transactions();
                self.table.evict_stale(STALE_CONTACT_AGE);
                self.token_secret = rand::random();
            }

            for event in std::mem::take(&mut self.events) {
                on_discovery(&event);
            }
            on_progress(&self.crawl_stats(started.elapsed()));

            if total_ticks != 0 && tick >= total_ticks {
                break;
            }
        }

        // Deliver sightings that arrived after the last tick fired.
        for event in std::mem::take(&mut self.events) {
            on_discovery(&event);
        }

        self.report(started.elapsed())
    }

    /// One receive step: wait up to `wait` for a datagram and dispatch it.
    ///
    /// Inbound queries are answered inline; responses are matched against the
    /// transaction registry by tid and source endpoint. Returns the matched
    /// record for the caller driving a lookup.
    async fn recv_step(&mut self, wait: Duration) -> Option<MatchedResponse> {
        let mut buf = [0u8; RECV_BUFFER];
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Err(_) => None,
            Ok(Err(e)) => {
                debug!(error = %e, "socket read error");
                None
            }
            Ok(Ok((len, from))) => self.handle_datagram(&buf[..len], from).await,
        }
    }

    async fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
    ) -> Option<MatchedResponse> {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_type_mismatch() {
                    self.counters.mismatched += 1;
                } else {
                    self.counters.malformed += 1;
                }
                debug!(%from, error = %e, "dropping undecodable datagram");
                // Tell the sender when the transaction id is recoverable.
                if let Some(tid) = recover_tid(data) {
                    let reply = Message::error_reply(tid, ERR_PROTOCOL, "Protocol Error");
                    self.send_reply(reply, from).await;
                }
                return None;
            }
        };

        match msg {
            Message::Query(query) => {
                self.handle_query(query, from).await;
                None
            }
            Message::Response(response) => self.handle_response(response, from).await,
            Message::Error(error) => {
                if self
                    .pending
                    .get(&error.tid)
                    .map(|p| p.dest == from)
                    .unwrap_or(false)
                {
                    self.pending.remove(&error.tid);
                    debug!(code = error.code, message = %error.message, %from, "peer reported an error");
                }
                None
            }
        }
    }

    async fn handle_query(&mut self, query: QueryMessage, from: SocketAddr) {
        self.counters.total_requests += 1;

        if let SocketAddr::V4(v4) = from {
            if let Ok(contact) = Contact::new(query.sender_id, v4) {
                self.insert_contact(contact).await;
            }
        }

        let reply = match query.query {
            Query::Ping => Message::ping_reply(query.tid, self.local_id),
            Query::FindNode { target } => Message::find_node_reply(
                query.tid,
                self.local_id,
                self.table.closest_nodes(&target, CLOSEST_REPLY),
            ),
            Query::GetPeers { info_hash } => {
                if let SocketAddr::V4(v4) = from {
                    self.record_discovery(info_hash, v4, DiscoveryOrigin::GetPeers);
                }
                let token = self.make_token(&from);
                Message::get_peers_reply(
                    query.tid,
                    self.local_id,
                    token,
                    self.table
                        .closest_nodes(&NodeId::from(info_hash), CLOSEST_REPLY),
                )
            }
            Query::SampleInfohashes { target } => {
                let samples: Vec<InfoHash> = self
                    .discovered
                    .keys()
                    .copied()
                    .choose_multiple(&mut rand::rng(), MAX_SAMPLES);
                self.counters.samples_sent += samples.len() as u64;
                Message::sample_reply(
                    query.tid,
                    self.local_id,
                    self.table.closest_nodes(&target, CLOSEST_REPLY),
                    samples,
                    SAMPLE_INTERVAL,
                    self.discovered.len() as i64,
                )
            }
            Query::Unknown => {
                debug!(method = %query.method, %from, "unknown method");
                Message::error_reply(query.tid, ERR_METHOD_UNKNOWN, "Method Unknown")
            }
        };

        self.send_reply(reply, from).await;
    }

    async fn handle_response(
        &mut self,
        response: ResponseMessage,
        from: SocketAddr,
    ) -> Option<MatchedResponse> {
        let ResponseMessage { tid, body } = response;

        let record = match self.pending.remove(&tid) {
            Some(record) if record.dest == from => record,
            Some(record) => {
                // Right tid, wrong endpoint: keep waiting for the real one.
                self.pending.insert(tid, record);
                return None;
            }
            None => {
                debug!(%from, "dropping unmatched response");
                return None;
            }
        };

        if let SocketAddr::V4(v4) = from {
            if let Ok(contact) = Contact::new(body.id, v4) {
                self.insert_contact(contact).await;
            }
        }
        for node in &body.nodes {
            self.insert_contact(node.clone()).await;
        }

        if self.config.bep51 && !body.samples.is_empty() {
            self.counters.samples_received += body.samples.len() as u64;
            if let SocketAddr::V4(v4) = from {
                for hash in &body.samples {
                    self.record_discovery(*hash, v4, DiscoveryOrigin::Bep51);
                }
            }
        }

        Some(MatchedResponse {
            tid,
            kind: record.kind,
            target: record.target,
            body,
        })
    }

    /// Inserts a contact; a full bucket triggers a liveness probe of its
    /// least-recently-seen member instead of an eviction.
    async fn insert_contact(&mut self, contact: Contact) {
        if let InsertOutcome::Deferred { probe } = self.table.insert(contact) {
            if !self.probe_in_flight(&probe.id) {
                self.send_query(
                    QueryKind::Ping,
                    SocketAddr::V4(probe.addr),
                    Some(probe.id),
                    |tid, id| Message::ping(tid, id),
                )
                .await;
            }
        }
    }

    fn probe_in_flight(&self, id: &NodeId) -> bool {
        self.pending
            .values()
            .any(|p| p.kind == QueryKind::Ping && p.dest_id.as_ref() == Some(id))
    }

    async fn active_burst(&mut self) {
        let target = NodeId::generate();
        let contacts = self.table.closest_nodes(&target, BURST_SIZE);
        debug!(count = contacts.len(), "active find_node burst");
        for contact in contacts {
            self.send_query(
                QueryKind::FindNode,
                SocketAddr::V4(contact.addr),
                Some(contact.id),
                |tid, id| Message::find_node(tid, id, target),
            )
            .await;
        }
    }

    /// Registers a transaction and sends the query it frames.
    ///
    /// On send failure the packet is dropped and the transaction cancelled.
    /// Returns the transaction id when the query went out.
    async fn send_query(
        &mut self,
        kind: QueryKind,
        dest: SocketAddr,
        dest_id: Option<NodeId>,
        build: impl FnOnce(TransactionId, NodeId) -> Message,
    ) -> Option<TransactionId> {
        let tid = self.next_tid();
        let msg = build(tid.clone(), self.local_id);
        let target = match &msg {
            Message::Query(q) => match &q.query {
                Query::FindNode { target } | Query::SampleInfohashes { target } => Some(target.0),
                Query::GetPeers { info_hash } => Some(info_hash.0),
                _ => None,
            },
            _ => None,
        };

        self.pending.insert(
            tid.clone(),
            PendingQuery {
                kind,
                target,
                dest,
                dest_id,
                deadline: Instant::now() + QUERY_TIMEOUT,
            },
        );

        match self.socket.send_to(&msg.to_bytes(), dest).await {
            Ok(_) => Some(tid),
            Err(e) => {
                debug!(%dest, error = %e, "send failed, cancelling transaction");
                self.pending.remove(&tid);
                None
            }
        }
    }

    async fn send_reply(&mut self, reply: Message, dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(&reply.to_bytes(), dest).await {
            debug!(%dest, error = %e, "failed to send reply");
        }
    }

    fn next_tid(&mut self) -> TransactionId {
        loop {
            let raw: [u8; 2] = rand::random();
            let tid = Bytes::copy_from_slice(&raw);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    /// Drops expired transactions and marks their destinations failed, which
    /// is what ultimately evicts an unresponsive probed contact.
    fn reap_transactions(&mut self) {
        let now = Instant::now();
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| tid.clone())
            .collect();

        for tid in expired {
            if let Some(record) = self.pending.remove(&tid) {
                if let Some(id) = record.dest_id {
                    self.table.mark_failed(&id);
                }
            }
        }
    }

    fn record_discovery(&mut self, hash: InfoHash, source: SocketAddrV4, origin: DiscoveryOrigin) {
        if !self.discovered.contains_key(&hash) {
            self.events.push(Discovery {
                info_hash: hash,
                source,
                origin,
            });
        }
        let entry = self
            .discovered
            .entry(hash)
            .or_insert_with(|| DiscoveredEntry {
                requests: 0,
                sources: HashSet::new(),
                origin,
            });
        if origin == DiscoveryOrigin::GetPeers {
            entry.requests += 1;
        }
        entry.sources.insert(source);
    }

    fn make_token(&self, from: &SocketAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(self.token_secret);
        hasher.update(from.ip().to_string().as_bytes());
        Bytes::copy_from_slice(&hasher.finalize()[..8])
    }

    fn crawl_stats(&self, elapsed: Duration) -> CrawlStats {
        let secs = elapsed.as_secs_f64();
        let unique = self.discovered.len();
        CrawlStats {
            elapsed,
            unique_info_hashes: unique,
            per_minute: if secs > 0.0 {
                unique as f64 / secs * 60.0
            } else {
                0.0
            },
            total_requests: self.counters.total_requests,
            table_size: self.table.len(),
            samples_sent: self.counters.samples_sent,
            samples_received: self.counters.samples_received,
        }
    }

    fn report(&self, elapsed: Duration) -> CrawlReport {
        let mut discovered: Vec<DiscoveredInfoHash> = self
            .discovered
            .iter()
            .map(|(hash, entry)| DiscoveredInfoHash {
                info_hash: *hash,
                requests: entry.requests,
                sources: entry.sources.len(),
                origin: entry.origin,
            })
            .collect();
        discovered.sort_by(|a, b| {
            b.requests
                .cmp(&a.requests)
                .then_with(|| a.info_hash.cmp(&b.info_hash))
        });

        CrawlReport {
            elapsed,
            discovered,
            total_requests: self.counters.total_requests,
            samples_sent: self.counters.samples_sent,
            samples_received: self.counters.samples_received,
            parse_errors: self.counters.malformed + self.counters.mismatched,
        }
    }
}

fn recover_tid(data: &[u8]) -> Option<TransactionId> {
    let value = bencode::decode(data).ok()?;
    let tid = value.get(b"t")?.as_bytes()?.clone();
    (!tid.is_empty()).then_some(tid)
}
