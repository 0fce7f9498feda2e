use super::krpc::{KrpcMessage, KrpcQuery, KrpcResponse};
use super::node::{NodeEntry, NodeId};
use super::peers::{PeerStore, QualityMetrics};
use super::routing::{InsertOutcome, RoutingTable, K};
use super::server::{DhtServer, LookupState};
use crate::types::InfoHash;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port)
}

#[test]
fn node_id_distance_is_xor() {
    let a = NodeId([0u8; 20]);
    let b = NodeId([0xFF; 20]);
    assert_eq!(a.distance(&b), [0xFF; 20]);
    assert_eq!(a.distance(&a), [0u8; 20]);
}

#[test]
fn node_id_bucket_index() {
    let local = NodeId([0u8; 20]);

    let mut first = [0u8; 20];
    first[0] = 0x80;
    assert_eq!(local.bucket_index(&NodeId(first)), 0);

    let mut mid = [0u8; 20];
    mid[1] = 0x01;
    assert_eq!(local.bucket_index(&NodeId(mid)), 15);

    let mut last = [0u8; 20];
    last[19] = 0x01;
    assert_eq!(local.bucket_index(&NodeId(last)), 159);
}

#[test]
fn node_entry_compact_round_trip() {
    let entry = NodeEntry::new(NodeId([7u8; 20]), addr(1, 6881));
    let compact = entry.to_compact().unwrap();
    let parsed = NodeEntry::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, entry.id);
    assert_eq!(parsed.addr, entry.addr);
}

#[test]
fn node_entry_two_failures_is_bad() {
    let mut entry = NodeEntry::new(NodeId::generate(), addr(1, 6881));
    assert!(entry.is_good());
    entry.fail();
    assert!(!entry.is_bad());
    entry.fail();
    assert!(entry.is_bad());
}

#[test]
fn routing_buckets_never_exceed_k() {
    let table = RoutingTable::new(NodeId::generate());
    for _ in 0..2000 {
        let entry = NodeEntry::new(NodeId::generate(), addr(rand::random(), 6881));
        table.insert(entry);
    }
    for size in table.bucket_sizes() {
        assert!(size <= K);
    }
}

#[test]
fn routing_full_bucket_hands_back_probe_target() {
    let local = NodeId([0u8; 20]);
    let table = RoutingTable::new(local);

    // All these ids land in bucket 0 (top bit differs from local).
    let make = |seed: u8| {
        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = seed;
        NodeEntry::new(NodeId(id), addr(seed, 6881))
    };

    for i in 0..K as u8 {
        assert!(matches!(table.insert(make(i)), InsertOutcome::Added));
    }

    let oldest_id = make(0).id;
    match table.insert(make(100)) {
        InsertOutcome::Probe(lru) => assert_eq!(lru.id, oldest_id),
        other => panic!("expected probe, got {:?}", other),
    }

    // Two failed probes evict the old entry and promote the candidate.
    table.mark_failed(&oldest_id);
    assert!(table.contains(&oldest_id));
    table.mark_failed(&oldest_id);
    assert!(!table.contains(&oldest_id));
    assert!(table.contains(&make(100).id));
}

#[test]
fn routing_find_closest_sorted_by_distance() {
    let local = NodeId::generate();
    let table = RoutingTable::new(local);
    for i in 0..50u8 {
        let mut id = [0u8; 20];
        id[0] = i.wrapping_mul(5);
        id[19] = i;
        table.insert(NodeEntry::new(NodeId(id), addr(i, 6881)));
    }

    let target = NodeId([0x42; 20]);
    let closest = table.find_closest(&target, K);
    assert!(closest.len() <= K);
    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
}

#[test]
fn krpc_query_round_trips() {
    let sender = NodeId::generate();
    let info_hash = InfoHash::generate();
    let queries = vec![
        KrpcQuery::Ping,
        KrpcQuery::FindNode {
            target: NodeId::generate(),
        },
        KrpcQuery::GetPeers { info_hash },
        KrpcQuery::AnnouncePeer {
            info_hash,
            port: 6881,
            token: Bytes::from_static(b"tokentok"),
            implied_port: false,
        },
    ];

    for query in queries {
        let message = KrpcMessage::Query {
            transaction_id: Bytes::from_static(b"aa"),
            sender_id: sender,
            query: query.clone(),
        };
        let parsed = KrpcMessage::parse(&message.encode()).unwrap();
        match parsed {
            KrpcMessage::Query {
                transaction_id,
                sender_id,
                query: parsed_query,
            } => {
                assert_eq!(transaction_id, Bytes::from_static(b"aa"));
                assert_eq!(sender_id, sender);
                assert_eq!(parsed_query.method(), query.method());
            }
            other => panic!("expected query, got {:?}", other),
        }
    }
}

#[test]
fn krpc_peers_response_round_trips() {
    let id = NodeId::generate();
    let nodes = vec![NodeEntry::new(NodeId([3u8; 20]), addr(3, 6881))];
    let peers = vec![addr(9, 51413)];

    let message = KrpcMessage::Response {
        transaction_id: Bytes::from_static(b"bb"),
        response: KrpcResponse::Peers {
            id,
            token: Bytes::from_static(b"tok"),
            peers: peers.clone(),
            nodes: nodes.clone(),
        },
    };

    match KrpcMessage::parse(&message.encode()).unwrap() {
        KrpcMessage::Response {
            response:
                KrpcResponse::Peers {
                    id: parsed_id,
                    token,
                    peers: parsed_peers,
                    nodes: parsed_nodes,
                },
            ..
        } => {
            assert_eq!(parsed_id, id);
            assert_eq!(token, Bytes::from_static(b"tok"));
            assert_eq!(parsed_peers, peers);
            assert_eq!(parsed_nodes.len(), 1);
            assert_eq!(parsed_nodes[0].id, nodes[0].id);
        }
        other => panic!("expected peers response, got {:?}", other),
    }
}

#[test]
fn krpc_error_round_trips() {
    let message = KrpcMessage::Response {
        transaction_id: Bytes::from_static(b"cc"),
        response: KrpcResponse::Error {
            code: 203,
            message: "Invalid token".to_string(),
        },
    };
    match KrpcMessage::parse(&message.encode()).unwrap() {
        KrpcMessage::Response {
            response: KrpcResponse::Error { code, message },
            ..
        } => {
            assert_eq!(code, 203);
            assert_eq!(message, "Invalid token");
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn krpc_rejects_garbage() {
    assert!(KrpcMessage::parse(b"not bencode").is_err());
    assert!(KrpcMessage::parse(b"d1:yi1ee").is_err());
}

#[test]
fn quality_score_weights() {
    let now = std::time::Instant::now();
    let perfect = QualityMetrics {
        response_time_ms: 0,
        reliability: 1.0,
        bandwidth_score: 1.0,
        uptime_pct: 1.0,
        last_updated: now,
    };
    assert!((perfect.score() - 1.0).abs() < 1e-9);

    let worst = QualityMetrics {
        response_time_ms: 5000,
        reliability: 0.0,
        bandwidth_score: 0.0,
        uptime_pct: 0.0,
        last_updated: now,
    };
    assert!(worst.score().abs() < 1e-9);

    let middle = QualityMetrics {
        response_time_ms: 2500,
        reliability: 0.5,
        bandwidth_score: 0.5,
        uptime_pct: 0.5,
        last_updated: now,
    };
    assert!((middle.score() - 0.5).abs() < 1e-9);

    // Response time past the cap cannot push the score negative.
    let slow = QualityMetrics {
        response_time_ms: 60_000,
        reliability: 0.0,
        bandwidth_score: 0.0,
        uptime_pct: 0.0,
        last_updated: now,
    };
    assert!(slow.score() >= 0.0);
}

#[test]
fn peer_store_observe_and_update() {
    let store = PeerStore::new();
    let endpoint = addr(1, 6881);

    store.observe(endpoint, None);
    let record = store.get(&endpoint).unwrap();
    assert!((record.quality_score - 0.5).abs() < 1e-9);

    store.update_quality(endpoint, QualityMetrics::from_wire(86_400, 1.0, 100));
    let record = store.get(&endpoint).unwrap();
    assert!(record.quality_score > 0.9);

    store.update_token_balance(endpoint, 777);
    assert_eq!(store.get(&endpoint).unwrap().token_balance, 777);

    assert_eq!(store.sweep(), 0);
    assert_eq!(store.len(), 1);
}

#[test]
fn peers_above_filters_by_quality() {
    let store = PeerStore::new();
    store.observe(addr(1, 1), None);
    store.update_quality(addr(2, 2), QualityMetrics::from_wire(86_400, 1.0, 100));

    assert_eq!(store.peers_above(0.9).len(), 1);
    assert_eq!(store.peers_above(0.0).len(), 2);
}

#[test]
fn lookup_converges_on_k_closest() {
    // A simulated network where every node answers a query with the K
    // globally closest nodes to the target.
    let n = 64usize;
    let population: Vec<NodeEntry> = (0..n)
        .map(|i| {
            let mut id = [0u8; 20];
            id[0] = (i * 7 % 251) as u8;
            id[1] = (i * 13 % 241) as u8;
            id[19] = i as u8;
            NodeEntry::new(NodeId(id), addr((i % 250) as u8, 6881 + i as u16))
        })
        .collect();

    let target = NodeId([0x55; 20]);

    let mut expected: Vec<NodeId> = population.iter().map(|e| e.id).collect();
    expected.sort_by(|a, b| a.distance(&target).cmp(&b.distance(&target)));
    expected.truncate(K);

    let respond = |_queried: &NodeEntry| -> Vec<NodeEntry> {
        let mut all = population.clone();
        all.sort_by(|a, b| a.id.distance(&target).cmp(&b.id.distance(&target)));
        all.truncate(K);
        all
    };

    // Seed with a handful of arbitrary nodes, as a routing table would.
    let seeds: Vec<NodeEntry> = population.iter().rev().take(3).cloned().collect();
    let mut state = LookupState::new(target, seeds);

    let max_rounds = (n as f64).log2().ceil() as usize + 2;
    let mut rounds = 0;
    loop {
        let batch = state.next_batch(3);
        if batch.is_empty() {
            break;
        }
        rounds += 1;
        assert!(rounds <= max_rounds, "lookup did not converge in {} rounds", max_rounds);
        for node in &batch {
            state.add_nodes(respond(node));
        }
        if state.converged() {
            break;
        }
    }

    let found: Vec<NodeId> = state.closest(K).into_iter().map(|e| e.id).collect();
    assert_eq!(found, expected);
}

#[test]
fn lookup_accumulates_peers_without_duplicates() {
    let mut state = LookupState::new(NodeId::generate(), Vec::new());
    state.add_peers(vec![addr(1, 1), addr(2, 2)]);
    state.add_peers(vec![addr(1, 1), addr(3, 3)]);
    assert_eq!(state.peers().len(), 3);
}

#[tokio::test]
async fn two_servers_announce_and_find() {
    let a = Arc::new(DhtServer::bind(0).await.unwrap());
    let b = Arc::new(DhtServer::bind(0).await.unwrap());
    let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

    tokio::spawn(Arc::clone(&a).run());
    tokio::spawn(Arc::clone(&b).run());

    // a learns about b via ping.
    let pong = a.ping(b_addr).await.unwrap();
    assert!(matches!(pong, KrpcResponse::Pong { .. }));

    // get_peers yields a token which authorizes an announce.
    let info_hash = InfoHash::generate();
    let response = a
        .send_query(b_addr, KrpcQuery::GetPeers { info_hash })
        .await
        .unwrap();
    let token = match response {
        KrpcResponse::Peers { token, peers, .. } => {
            assert!(peers.is_empty());
            token
        }
        other => panic!("expected peers response, got {:?}", other),
    };

    let announced = a
        .send_query(
            b_addr,
            KrpcQuery::AnnouncePeer {
                info_hash,
                port: 7000,
                token,
                implied_port: false,
            },
        )
        .await
        .unwrap();
    assert!(matches!(announced, KrpcResponse::Pong { .. } | KrpcResponse::Announced { .. }));

    // The announce is now visible to get_peers.
    let response = a
        .send_query(b_addr, KrpcQuery::GetPeers { info_hash })
        .await
        .unwrap();
    match response {
        KrpcResponse::Peers { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].port(), 7000);
        }
        other => panic!("expected peers response, got {:?}", other),
    }
}

#[tokio::test]
async fn stale_token_rejected() {
    let a = Arc::new(DhtServer::bind(0).await.unwrap());
    let b = Arc::new(DhtServer::bind(0).await.unwrap());
    let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

    tokio::spawn(Arc::clone(&a).run());
    tokio::spawn(Arc::clone(&b).run());

    let info_hash = InfoHash::generate();
    let response = a
        .send_query(
            b_addr,
            KrpcQuery::AnnouncePeer {
                info_hash,
                port: 7000,
                token: Bytes::from_static(b"bogustok"),
                implied_port: false,
            },
        )
        .await
        .unwrap();
    assert!(matches!(response, KrpcResponse::Error { code: 203, .. }));
}

#[test]
fn storage_reports_not_implemented() {
    // Callers must handle the unimplemented k/v interface.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let server = runtime.block_on(DhtServer::bind(0)).unwrap();
    assert!(matches!(
        server.store_value(InfoHash::generate(), b"data"),
        Err(super::DhtError::NotImplemented)
    ));
    assert!(matches!(
        server.retrieve_value(InfoHash::generate()),
        Err(super::DhtError::NotImplemented)
    ));
}
