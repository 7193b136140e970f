use super::lookup::LookupState;
use super::*;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
}

fn contact(id: [u8; 20], addr: SocketAddrV4) -> Contact {
    Contact::new(NodeId(id), addr).unwrap()
}

fn id_with_first(byte: u8, rest: u8) -> [u8; 20] {
    let mut id = [rest; 20];
    id[0] = byte;
    id
}

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1, id2);
    assert_ne!(id1.0, [0u8; 20]);
}

#[test]
fn test_node_id_from_bytes() {
    assert_eq!(NodeId::from_bytes(&[1u8; 20]).unwrap().0, [1u8; 20]);
    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_distance_identities() {
    let a = NodeId::generate();
    let b = NodeId::generate();
    let c = NodeId::generate();

    assert_eq!(a.distance(&a), [0u8; 20]);
    assert_eq!(a.distance(&b), b.distance(&a));

    // d(a,b) xor d(b,c) == d(a,c)
    let ab = a.distance(&b);
    let bc = b.distance(&c);
    let ac = a.distance(&c);
    let mut combined = [0u8; 20];
    for i in 0..20 {
        combined[i] = ab[i] ^ bc[i];
    }
    assert_eq!(combined, ac);
}

#[test]
fn test_distance_literals() {
    let zero = NodeId([0u8; 20]);
    let mut one = [0u8; 20];
    one[19] = 1;
    let mut expected = [0u8; 20];
    expected[19] = 1;
    assert_eq!(zero.distance(&NodeId(one)), expected);

    // d(0xFF.., 0x00..) is the maximum distance, 2^160 - 1.
    assert_eq!(NodeId([0xFF; 20]).distance(&zero), [0xFF; 20]);
}

#[test]
fn test_bucket_index() {
    let own = NodeId([0u8; 20]);

    // Differing in the most significant bit lands in bucket 0.
    let mut far = [0u8; 20];
    far[0] = 0x80;
    assert_eq!(own.bucket_index(&NodeId(far)), 0);

    // Differing only in the least significant bit lands in bucket 159.
    let mut near = [0u8; 20];
    near[19] = 0x01;
    assert_eq!(own.bucket_index(&NodeId(near)), 159);

    for _ in 0..100 {
        let other = NodeId::generate();
        if other != own {
            assert!(own.bucket_index(&other) < 160);
        }
    }
}

#[test]
fn test_contact_compact_literal() {
    let node = contact([b'A'; 20], v4(192, 168, 1, 1, 6881));
    let compact = node.to_compact();

    let mut expected = [0u8; 26];
    expected[..20].copy_from_slice(&[b'A'; 20]);
    expected[20..24].copy_from_slice(&[0xc0, 0xa8, 0x01, 0x01]);
    expected[24..26].copy_from_slice(&[0x1a, 0xe1]);
    assert_eq!(compact, expected);

    let parsed = Contact::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, node.id);
    assert_eq!(parsed.addr, node.addr);
}

#[test]
fn test_contact_rejects_bad_endpoints() {
    assert!(Contact::new(NodeId([1; 20]), v4(127, 0, 0, 1, 0)).is_err());

    assert!(Contact::from_compact(&[0u8; 25]).is_none());
    let mut zero_port = [1u8; 26];
    zero_port[24] = 0;
    zero_port[25] = 0;
    assert!(Contact::from_compact(&zero_port).is_none());
}

#[test]
fn test_pack_unpack_nodes_roundtrip() {
    let nodes = vec![
        contact([1; 20], v4(10, 0, 0, 1, 6881)),
        contact([2; 20], v4(10, 0, 0, 2, 6882)),
        contact([3; 20], v4(10, 0, 0, 3, 6883)),
    ];
    let packed = pack_nodes(&nodes);
    assert_eq!(packed.len() % 26, 0);

    let unpacked = unpack_nodes(&packed).unwrap();
    assert_eq!(unpacked.len(), 3);
    for (a, b) in nodes.iter().zip(&unpacked) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.addr, b.addr);
    }
}

#[test]
fn test_routing_rejects_own_id() {
    let own = NodeId([7; 20]);
    let table = RoutingTable::new(own);
    let outcome = table.insert(contact([7; 20], v4(10, 0, 0, 1, 6881)));
    assert_eq!(outcome, InsertOutcome::Ignored);
    assert_eq!(table.len(), 0);
}

#[test]
fn test_routing_rejects_duplicate_endpoint() {
    let table = RoutingTable::new(NodeId([0; 20]));
    let addr = v4(10, 0, 0, 1, 6881);

    assert_eq!(table.insert(contact([1; 20], addr)), InsertOutcome::Inserted);
    assert_eq!(table.insert(contact([2; 20], addr)), InsertOutcome::Ignored);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_routing_refresh_moves_to_mru() {
    let table = RoutingTable::new(NodeId([0; 20]));
    // All in bucket 0, bucket has room for both.
    let a = contact(id_with_first(0x80, 1), v4(10, 0, 0, 1, 6881));
    let b = contact(id_with_first(0x81, 2), v4(10, 0, 0, 2, 6881));

    assert_eq!(table.insert(a.clone()), InsertOutcome::Inserted);
    assert_eq!(table.insert(b), InsertOutcome::Inserted);
    assert_eq!(table.insert(a), InsertOutcome::Updated);
    assert_eq!(table.len(), 2);
}

#[test]
fn test_routing_full_bucket_probes_then_evicts() {
    let own = NodeId([0; 20]);
    let table = RoutingTable::new(own);

    // K distinct IDs that all share bucket 0 (leading bit set).
    let mut first = None;
    for i in 0..8u8 {
        let c = contact(id_with_first(0x80 | i, i + 1), v4(10, 0, 0, i + 1, 6881));
        if first.is_none() {
            first = Some(c.id);
        }
        assert_eq!(table.insert(c), InsertOutcome::Inserted);
    }
    let lru = first.unwrap();

    // Overflow defers and names the least-recently-seen contact.
    let newcomer = contact(id_with_first(0x88 | 0x07, 0xAA), v4(10, 0, 0, 99, 6881));
    let newcomer_id = newcomer.id;
    match table.insert(newcomer) {
        InsertOutcome::Deferred { probe } => assert_eq!(probe.id, lru),
        other => panic!("expected Deferred, got {:?}", other),
    }
    assert!(table.get(&newcomer_id).is_none());

    // Probe timeouts accumulate; the victim is replaced by the newcomer.
    for _ in 0..3 {
        table.mark_failed(&lru);
    }
    assert!(table.get(&lru).is_none());
    assert!(table.get(&newcomer_id).is_some());
    assert_eq!(table.len(), 8);
}

#[test]
fn test_routing_invariants_hold_under_load() {
    let own = NodeId::generate();
    let table = RoutingTable::new(own);

    for i in 0..200u16 {
        let mut id = [0u8; 20];
        id[0] = (i >> 8) as u8;
        id[1] = i as u8;
        id[19] = 1;
        let addr = v4(10, (i >> 8) as u8, i as u8, 1, 6881);
        table.insert(contact(id, addr));
    }

    let all = table.closest_nodes(&own, 1000);
    assert_eq!(all.len(), table.len());

    let ids: HashSet<_> = all.iter().map(|c| c.id.0).collect();
    assert_eq!(ids.len(), all.len(), "duplicate IDs in table");
    assert!(!ids.contains(&own.0), "own ID in table");
}

#[test]
fn test_closest_nodes() {
    let table = RoutingTable::new(NodeId([0; 20]));
    let target = NodeId([0; 20]);

    assert!(table.closest_nodes(&target, 8).is_empty());

    for i in 1..=20u8 {
        table.insert(contact(id_with_first(i, i), v4(192, 168, 1, i, 6881)));
    }

    let closest = table.closest_nodes(&target, 8);
    assert_eq!(closest.len(), 8);
    let mut last = [0u8; 20];
    for c in &closest {
        let dist = c.id.distance(&target);
        assert!(dist >= last, "closest_nodes not distance-sorted");
        last = dist;
    }
}

#[test]
fn test_routing_evicts_stale_contacts() {
    let table = RoutingTable::new(NodeId([0; 20]));
    let mut old = contact([1; 20], v4(10, 0, 0, 1, 6881));
    let Some(past) = std::time::Instant::now().checked_sub(Duration::from_secs(16 * 60)) else {
        // Monotonic clock too close to its origin to backdate; nothing to test.
        return;
    };
    old.last_seen = past;
    table.insert(old);
    table.insert(contact([2; 20], v4(10, 0, 0, 2, 6881)));

    assert_eq!(table.evict_stale(Duration::from_secs(15 * 60)), 1);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_bucket_size_validation() {
    assert!(RoutingTable::with_k(NodeId([1; 20]), 0).is_err());
    assert!(RoutingTable::with_k(NodeId([1; 20]), 101).is_err());
    assert!(RoutingTable::with_k(NodeId([1; 20]), 1).is_ok());
    assert!(RoutingTable::with_k(NodeId([1; 20]), 100).is_ok());
}

#[test]
fn test_ping_wire_format() {
    let msg = Message::ping(Bytes::from_static(b"aa"), NodeId([b'A'; 20]));
    assert_eq!(
        msg.to_bytes(),
        b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q4:ping1:t2:aa1:y1:qe"
    );

    let reply = Message::ping_reply(Bytes::from_static(b"aa"), NodeId([b'B'; 20]));
    assert_eq!(
        reply.to_bytes(),
        b"d1:rd2:id20:BBBBBBBBBBBBBBBBBBBBe1:t2:aa1:y1:re"
    );
}

#[test]
fn test_find_node_roundtrip() {
    let target = NodeId::generate();
    let msg = Message::find_node(Bytes::from_static(b"bb"), NodeId::generate(), target);

    match Message::parse(&msg.to_bytes()).unwrap() {
        Message::Query(q) => {
            assert_eq!(q.tid, Bytes::from_static(b"bb"));
            assert_eq!(q.method, "find_node");
            match q.query {
                Query::FindNode { target: t } => assert_eq!(t, target),
                other => panic!("wrong query: {:?}", other),
            }
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_get_peers_roundtrip() {
    let info_hash = InfoHash([0xAB; 20]);
    let msg = Message::get_peers(Bytes::from_static(b"cc"), NodeId::generate(), info_hash);

    match Message::parse(&msg.to_bytes()).unwrap() {
        Message::Query(q) => match q.query {
            Query::GetPeers { info_hash: h } => assert_eq!(h, info_hash),
            other => panic!("wrong query: {:?}", other),
        },
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_sample_infohashes_roundtrip() {
    let target = NodeId::generate();
    let msg = Message::sample_infohashes(Bytes::from_static(b"dd"), NodeId::generate(), target);

    match Message::parse(&msg.to_bytes()).unwrap() {
        Message::Query(q) => {
            assert_eq!(q.method, "sample_infohashes");
            match q.query {
                Query::SampleInfohashes { target: t } => assert_eq!(t, target),
                other => panic!("wrong query: {:?}", other),
            }
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_get_peers_reply_roundtrip() {
    let responder = NodeId::generate();
    let nodes = vec![contact([5; 20], v4(10, 0, 0, 5, 6885))];
    let reply = Message::get_peers_reply(
        Bytes::from_static(b"cc"),
        responder,
        Bytes::from_static(b"tok"),
        nodes,
    );

    match Message::parse(&reply.to_bytes()).unwrap() {
        Message::Response(r) => {
            assert_eq!(r.body.id, responder);
            assert_eq!(r.body.token.as_deref(), Some(b"tok".as_slice()));
            assert_eq!(r.body.nodes.len(), 1);
            assert_eq!(r.body.nodes[0].addr, v4(10, 0, 0, 5, 6885));
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_peer_values_roundtrip() {
    let mut body = ResponseBody::new(NodeId::generate());
    body.peers = vec![v4(1, 2, 3, 4, 80), v4(5, 6, 7, 8, 443)];
    let msg = Message::Response(ResponseMessage {
        tid: Bytes::from_static(b"pp"),
        body,
    });

    match Message::parse(&msg.to_bytes()).unwrap() {
        Message::Response(r) => {
            assert_eq!(r.body.peers, vec![v4(1, 2, 3, 4, 80), v4(5, 6, 7, 8, 443)]);
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_response_rejects_ragged_nodes() {
    // 25-byte nodes field: not a multiple of 26.
    let raw = format!(
        "d1:rd2:id20:{}5:nodes25:{}e1:t2:aa1:y1:re",
        "A".repeat(20),
        "B".repeat(25)
    );
    let err = Message::parse(raw.as_bytes()).unwrap_err();
    assert!(err.is_type_mismatch());
}

#[test]
fn test_response_rejects_ragged_samples() {
    let raw = format!(
        "d1:rd2:id20:{}7:samples30:{}e1:t2:aa1:y1:re",
        "A".repeat(20),
        "B".repeat(30)
    );
    let err = Message::parse(raw.as_bytes()).unwrap_err();
    assert!(err.is_type_mismatch());
}

#[test]
fn test_samples_truncated_on_reception() {
    // 25 concatenated hashes arrive; only 20 are kept.
    let mut samples = Vec::new();
    for i in 0..25u8 {
        samples.extend_from_slice(&[i; 20]);
    }
    let raw = [
        format!("d1:rd2:id20:{}7:samples{}:", "A".repeat(20), samples.len()).into_bytes(),
        samples,
        b"e1:t2:aa1:y1:re".to_vec(),
    ]
    .concat();

    match Message::parse(&raw).unwrap() {
        Message::Response(r) => assert_eq!(r.body.samples.len(), MAX_SAMPLES),
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_sample_reply_clamps_emission() {
    let samples: Vec<InfoHash> = (0..50u8).map(|i| InfoHash([i; 20])).collect();
    let reply = Message::sample_reply(
        Bytes::from_static(b"sa"),
        NodeId::generate(),
        Vec::new(),
        samples,
        21600,
        50,
    );

    match Message::parse(&reply.to_bytes()).unwrap() {
        Message::Response(r) => {
            assert_eq!(r.body.samples.len(), MAX_SAMPLES);
            assert_eq!(r.body.num, Some(50));
            assert_eq!(r.body.interval, Some(21600));
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_unknown_method_carried_through() {
    let raw = format!(
        "d1:ad2:id20:{}e1:q13:announce_peer1:t2:aa1:y1:qe",
        "A".repeat(20)
    );
    match Message::parse(raw.as_bytes()).unwrap() {
        Message::Query(q) => {
            assert_eq!(q.method, "announce_peer");
            assert!(matches!(q.query, Query::Unknown));
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_error_message_roundtrip() {
    let msg = Message::error_reply(Bytes::from_static(b"ee"), ERR_METHOD_UNKNOWN, "Method Unknown");
    match Message::parse(&msg.to_bytes()).unwrap() {
        Message::Error(e) => {
            assert_eq!(e.code, 204);
            assert_eq!(e.message, "Method Unknown");
        }
        other => panic!("wrong message: {:?}", other),
    }
}

#[test]
fn test_parse_rejects_bad_frames() {
    // Not a dict.
    assert!(Message::parse(b"i42e").is_err());
    // Missing transaction id.
    assert!(Message::parse(b"d1:y1:qe").is_err());
    // Empty transaction id.
    assert!(Message::parse(b"d1:t0:1:y1:qe").is_err());
    // Wrong id length in query args.
    let raw = format!("d1:ad2:id19:{}e1:q4:ping1:t2:aa1:y1:qe", "A".repeat(19));
    assert!(Message::parse(raw.as_bytes()).unwrap_err().is_type_mismatch());
}

#[test]
fn test_lookup_orders_and_terminates() {
    let target = InfoHash([0; 20]);
    let far = contact(id_with_first(0x40, 0), v4(10, 0, 0, 1, 6881));
    let near = contact(id_with_first(0x01, 0), v4(10, 0, 0, 2, 6881));
    let mut lookup = LookupState::new(target, vec![far.clone(), near.clone()]);

    // Seeds set the baseline without counting as progress.
    assert!(!lookup.round_improved());

    let batch = lookup.next_batch(1);
    assert_eq!(batch[0].id, near.id, "closest candidate queried first");

    lookup.begin_round();
    // Learning something farther than the best seen is not progress.
    lookup.add_candidate(contact(id_with_first(0x20, 0), v4(10, 0, 0, 3, 6881)));
    assert!(!lookup.round_improved());

    // Strictly closer than everything known counts.
    let mut closer = [0u8; 20];
    closer[19] = 1;
    lookup.add_candidate(contact(closer, v4(10, 0, 0, 4, 6881)));
    assert!(lookup.round_improved());

    // Queried IDs never re-enter the candidate set.
    lookup.add_candidate(near.clone());
    let rest = lookup.next_batch(10);
    assert!(rest.iter().all(|c| c.id != near.id));
}

#[test]
fn test_lookup_peers_dedup_in_order() {
    let mut lookup = LookupState::new(InfoHash([0; 20]), Vec::new());
    lookup.add_peers(vec![v4(1, 1, 1, 1, 1), v4(2, 2, 2, 2, 2)]);
    lookup.add_peers(vec![v4(1, 1, 1, 1, 1), v4(3, 3, 3, 3, 3)]);

    assert_eq!(
        lookup.into_peers(),
        vec![v4(1, 1, 1, 1, 1), v4(2, 2, 2, 2, 2), v4(3, 3, 3, 3, 3)]
    );
}

fn test_config() -> EngineConfig {
    EngineConfig {
        port: 0,
        bootstrap: Vec::new(),
        ..EngineConfig::default()
    }
}

async fn drain_messages(socket: &UdpSocket) -> HashMap<Vec<u8>, Message> {
    let mut out = HashMap::new();
    let mut buf = [0u8; 2048];
    while let Ok((len, _)) = socket.try_recv_from(&mut buf) {
        if let Ok(msg) = Message::parse(&buf[..len]) {
            let tid = match &msg {
                Message::Query(q) => q.tid.to_vec(),
                Message::Response(r) => r.tid.to_vec(),
                Message::Error(e) => e.tid.to_vec(),
            };
            out.insert(tid, msg);
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_crawl_tick_schedule() {
    let mut engine = DhtEngine::bind(test_config()).await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    engine
        .routing_table()
        .insert(contact([0x42; 20], v4(127, 0, 0, 1, peer_port)));

    let cancel = CancelFlag::new();
    let mut ticks = Vec::new();
    engine
        .crawl(
            Duration::from_secs(10),
            3,
            &cancel,
            |_| {},
            |stats| ticks.push(stats.elapsed.as_secs()),
        )
        .await;

    // One progress callback per tick, at exact 1 Hz on the paused clock.
    assert_eq!(ticks, (1..=10).collect::<Vec<u64>>());

    // Bursts fired on ticks 3, 6, 9; the table holds a single contact, so
    // each burst produced one find_node query.
    let mut bursts = 0;
    let mut buf = [0u8; 2048];
    while let Ok((len, _)) = peer.try_recv_from(&mut buf) {
        match Message::parse(&buf[..len]).unwrap() {
            Message::Query(q) => {
                assert_eq!(q.method, "find_node");
                bursts += 1;
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
    assert_eq!(bursts, 3);
}

#[tokio::test]
async fn test_crawl_answers_inbound_queries() {
    let engine = DhtEngine::bind(test_config()).await.unwrap();
    let engine_id = *engine.local_id();
    let engine_addr = SocketAddr::from(([127, 0, 0, 1], engine.port()));

    let cancel = CancelFlag::new();
    let worker = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut engine = engine;
            let mut discoveries = Vec::new();
            let report = engine
                .crawl(
                    Duration::from_secs(2),
                    10,
                    &cancel,
                    |d| discoveries.push(d.clone()),
                    |_| {},
                )
                .await;
            (report, discoveries)
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let helper = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_id = NodeId([0xBB; 20]);
    let info_hash = InfoHash([0xAB; 20]);

    let ping = Message::ping(Bytes::from_static(b"aa"), remote_id);
    helper.send_to(&ping.to_bytes(), engine_addr).await.unwrap();

    let get_peers = Message::get_peers(Bytes::from_static(b"gp"), remote_id, info_hash);
    helper
        .send_to(&get_peers.to_bytes(), engine_addr)
        .await
        .unwrap();

    let unknown = format!(
        "d1:ad2:id20:{}e1:q13:announce_peer1:t2:uu1:y1:qe",
        "B".repeat(20)
    );
    helper.send_to(unknown.as_bytes(), engine_addr).await.unwrap();

    // Field-level breakage with a recoverable tid draws error 203.
    helper
        .send_to(b"d1:t2:mm1:y1:qe", engine_addr)
        .await
        .unwrap();
    // Raw garbage is dropped silently.
    helper.send_to(b"garbage", engine_addr).await.unwrap();

    let (report, discoveries) = worker.await.unwrap();
    let replies = drain_messages(&helper).await;

    match replies.get(b"aa".as_slice()).expect("ping reply") {
        Message::Response(r) => assert_eq!(r.body.id, engine_id),
        other => panic!("unexpected ping reply: {:?}", other),
    }
    match replies.get(b"gp".as_slice()).expect("get_peers reply") {
        Message::Response(r) => {
            assert!(r.body.token.is_some());
            assert!(r.body.peers.is_empty());
        }
        other => panic!("unexpected get_peers reply: {:?}", other),
    }
    match replies.get(b"uu".as_slice()).expect("unknown-method reply") {
        Message::Error(e) => assert_eq!(e.code, ERR_METHOD_UNKNOWN),
        other => panic!("unexpected unknown-method reply: {:?}", other),
    }
    match replies.get(b"mm".as_slice()).expect("malformed-query reply") {
        Message::Error(e) => assert_eq!(e.code, ERR_PROTOCOL),
        other => panic!("unexpected malformed-query reply: {:?}", other),
    }

    assert_eq!(discoveries.len(), 1);
    assert_eq!(discoveries[0].info_hash, info_hash);
    assert_eq!(discoveries[0].origin, DiscoveryOrigin::GetPeers);

    assert_eq!(report.total_requests, 3);
    assert_eq!(report.parse_errors, 2);
    assert_eq!(report.discovered.len(), 1);
    assert_eq!(report.discovered[0].requests, 1);
}

#[tokio::test]
async fn test_sample_infohashes_emission() {
    let engine = DhtEngine::bind(test_config()).await.unwrap();
    let engine_addr = SocketAddr::from(([127, 0, 0, 1], engine.port()));

    let cancel = CancelFlag::new();
    let worker = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut engine = engine;
            engine
                .crawl(Duration::from_secs(2), 10, &cancel, |_| {}, |_| {})
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let helper = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_id = NodeId([0xCC; 20]);

    for i in 0..50u8 {
        let msg = Message::get_peers(
            Bytes::copy_from_slice(&[b'q', i]),
            remote_id,
            InfoHash([i; 20]),
        );
        helper.send_to(&msg.to_bytes(), engine_addr).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let sample = Message::sample_infohashes(Bytes::from_static(b"sa"), remote_id, NodeId::generate());
    helper.send_to(&sample.to_bytes(), engine_addr).await.unwrap();

    let report = worker.await.unwrap();
    let replies = drain_messages(&helper).await;

    match replies.get(b"sa".as_slice()).expect("sample reply") {
        Message::Response(r) => {
            assert_eq!(r.body.samples.len(), MAX_SAMPLES);
            let distinct: HashSet<_> = r.body.samples.iter().map(|h| h.0).collect();
            assert_eq!(distinct.len(), MAX_SAMPLES, "sampled with replacement");
            assert_eq!(r.body.num, Some(50));
            assert!(r.body.interval.unwrap_or(-1) >= 0);
        }
        other => panic!("unexpected sample reply: {:?}", other),
    }

    assert_eq!(report.discovered.len(), 50);
    assert_eq!(report.samples_sent, MAX_SAMPLES as u64);
}

#[tokio::test]
async fn test_scrape_collects_peers() {
    let mut engine = DhtEngine::bind(test_config()).await.unwrap();

    let fake_node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_port = fake_node.local_addr().unwrap().port();
    let fake_id = NodeId([0x11; 20]);

    engine
        .routing_table()
        .insert(contact(fake_id.0, v4(127, 0, 0, 1, fake_port)));

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = fake_node.recv_from(&mut buf).await.unwrap();
            if let Ok(Message::Query(q)) = Message::parse(&buf[..len]) {
                if matches!(q.query, Query::GetPeers { .. }) {
                    let mut body = ResponseBody::new(fake_id);
                    body.token = Some(Bytes::from_static(b"tok"));
                    body.peers = vec![v4(10, 0, 0, 1, 1234), v4(10, 0, 0, 2, 5678)];
                    let reply = Message::Response(ResponseMessage { tid: q.tid, body });
                    fake_node.send_to(&reply.to_bytes(), from).await.unwrap();
                }
            }
        }
    });

    let cancel = CancelFlag::new();
    let peers = engine
        .scrape_peers(InfoHash([0xEE; 20]), Duration::from_secs(5), &cancel)
        .await;

    assert_eq!(peers, vec![v4(10, 0, 0, 1, 1234), v4(10, 0, 0, 2, 5678)]);
}

#[tokio::test]
async fn test_bep51_samples_ingested_from_responses() {
    let fake_node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_port = fake_node.local_addr().unwrap().port();
    let fake_id = NodeId([0x33; 20]);

    let mut config = test_config();
    config.bootstrap = vec![format!("127.0.0.1:{}", fake_port)];
    let mut engine = DhtEngine::bind(config).await.unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (len, from) = fake_node.recv_from(&mut buf).await.unwrap();
        let msg = Message::parse(&buf[..len]).unwrap();
        let tid = match msg {
            Message::Query(q) => q.tid,
            other => panic!("expected query, got {:?}", other),
        };
        let samples: Vec<InfoHash> = (1..=3u8).map(|i| InfoHash([i; 20])).collect();
        let reply = Message::sample_reply(tid, fake_id, Vec::new(), samples, 21600, 3);
        fake_node.send_to(&reply.to_bytes(), from).await.unwrap();
    });

    engine.bootstrap().await.unwrap();

    let cancel = CancelFlag::new();
    let mut discoveries = Vec::new();
    let report = engine
        .crawl(
            Duration::from_secs(1),
            10,
            &cancel,
            |d| discoveries.push(d.clone()),
            |_| {},
        )
        .await;

    assert_eq!(report.samples_received, 3);
    assert_eq!(discoveries.len(), 3);
    assert!(discoveries
        .iter()
        .all(|d| d.origin == DiscoveryOrigin::Bep51));
    assert_eq!(report.discovered.len(), 3);
    assert!(report.discovered.iter().all(|d| d.requests == 0));
}

#[tokio::test]
async fn test_response_requires_matching_source() {
    let honest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let honest_port = honest.local_addr().unwrap().port();
    let spoofer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = test_config();
    config.bootstrap = vec![format!("127.0.0.1:{}", honest_port)];
    let mut engine = DhtEngine::bind(config).await.unwrap();

    let planted = contact([0x55; 20], v4(10, 0, 0, 5, 6881));
    let spoofed = contact([0x66; 20], v4(10, 0, 0, 6, 6881));

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (len, from) = honest.recv_from(&mut buf).await.unwrap();
        let tid = match Message::parse(&buf[..len]).unwrap() {
            Message::Query(q) => q.tid,
            other => panic!("expected query, got {:?}", other),
        };

        // A third party echoing the right tid from the wrong endpoint.
        let forged = Message::find_node_reply(tid.clone(), NodeId([0x22; 20]), vec![spoofed]);
        spoofer.send_to(&forged.to_bytes(), from).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let genuine = Message::find_node_reply(tid, NodeId([0x44; 20]), vec![planted]);
        honest.send_to(&genuine.to_bytes(), from).await.unwrap();
    });

    engine.bootstrap().await.unwrap();

    assert!(engine.routing_table().get(&NodeId([0x66; 20])).is_none());
    assert!(engine.routing_table().get(&NodeId([0x55; 20])).is_some());
}
