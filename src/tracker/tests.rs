use super::http::{encode_announce, encode_failure, parse_query};
use super::swarm::{
    AnnounceEvent, AnnounceRequest, SwarmRegistry, DEFAULT_MAX_PEERS, DEFAULT_PEER_TIMEOUT,
};
use super::udp::UdpTrackerServer;
use crate::bencode;
use crate::types::InfoHash;
use crate::wire::PeerId;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn registry(nerd: bool) -> SwarmRegistry {
    SwarmRegistry::new(nerd, DEFAULT_MAX_PEERS, DEFAULT_PEER_TIMEOUT)
}

fn peer_id(tag: u8) -> PeerId {
    let mut id = [tag; 20];
    id[0] = b'-';
    PeerId(id)
}

fn announce(
    registry: &SwarmRegistry,
    info_hash: InfoHash,
    id: PeerId,
    left: u64,
    event: AnnounceEvent,
) -> super::swarm::AnnounceReply {
    registry.announce(&AnnounceRequest {
        info_hash,
        peer_id: id,
        ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
        port: 6881,
        uploaded: 0,
        downloaded: 0,
        left,
        event,
        numwant: 50,
        user_agent: None,
    })
}

#[test]
fn seed_and_leech_counts_follow_left() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(2), 100, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(3), 50, AnnounceEvent::None);

    let (seeds, leeches, total) = registry.swarm_counts(&hash).unwrap();
    assert_eq!((seeds, leeches, total), (1, 2, 3));

    // The leecher finishing flips it to a seeder.
    announce(&registry, hash, peer_id(2), 0, AnnounceEvent::Completed);
    let (seeds, leeches, total) = registry.swarm_counts(&hash).unwrap();
    assert_eq!((seeds, leeches, total), (2, 1, 3));
}

#[test]
fn counts_invariant_under_random_sequences() {
    let registry = registry(false);
    let hash = InfoHash::generate();

    for round in 0..200u32 {
        let id = peer_id((round % 17) as u8);
        let left = u64::from(round % 3) * 10;
        let event = match round % 5 {
            0 => AnnounceEvent::Started,
            1 => AnnounceEvent::Stopped,
            2 => AnnounceEvent::Completed,
            _ => AnnounceEvent::None,
        };
        announce(&registry, hash, id, left, event);

        if let Some((seeds, leeches, total)) = registry.swarm_counts(&hash) {
            assert_eq!(seeds + leeches, total);
        }
    }
}

#[test]
fn stopped_removes_peer() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(2), 10, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Stopped);

    let (seeds, leeches, total) = registry.swarm_counts(&hash).unwrap();
    assert_eq!((seeds, leeches, total), (0, 1, 1));
}

#[test]
fn scrape_after_seeder_and_leecher() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(2), 100, AnnounceEvent::None);

    let counts = registry.scrape(&hash).unwrap();
    assert_eq!(counts.complete, 1);
    assert_eq!(counts.incomplete, 1);
    assert_eq!(counts.downloaded, 0);

    announce(&registry, hash, peer_id(2), 0, AnnounceEvent::Completed);
    let counts = registry.scrape(&hash).unwrap();
    assert_eq!(counts.downloaded, 1);

    // The completion counter never goes back down.
    announce(&registry, hash, peer_id(2), 0, AnnounceEvent::Stopped);
    let counts = registry.scrape(&hash).unwrap();
    assert_eq!(counts.downloaded, 1);
}

#[test]
fn reply_excludes_caller() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    let reply = announce(&registry, hash, peer_id(2), 100, AnnounceEvent::Started);

    assert_eq!(reply.peers.len(), 1);
    assert_eq!(reply.peers[0].peer_id, peer_id(1));
    assert_eq!(reply.interval, 1800);
    assert_eq!(reply.min_interval, 300);
}

#[test]
fn nerd_selection_sorts_by_quality_then_peer_id() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    for tag in 1..=4u8 {
        announce(&registry, hash, peer_id(tag), 0, AnnounceEvent::Started);
    }
    registry.update_peer_quality(&peer_id(2), 0.9);
    registry.update_peer_quality(&peer_id(3), 0.9);
    registry.update_peer_quality(&peer_id(4), 0.1);

    let reply = announce(&registry, hash, peer_id(9), 100, AnnounceEvent::Started);
    let order: Vec<PeerId> = reply.peers.iter().map(|p| p.peer_id).collect();

    // 0.9 ties break lexicographically; default 0.5 next; 0.1 last.
    assert_eq!(order, vec![peer_id(2), peer_id(3), peer_id(1), peer_id(4)]);
}

#[test]
fn numwant_clamped() {
    let registry = registry(true);
    assert_eq!(registry.clamp_numwant(None), DEFAULT_MAX_PEERS);
    assert_eq!(registry.clamp_numwant(Some(0)), 1);
    assert_eq!(registry.clamp_numwant(Some(10)), 10);
    assert_eq!(registry.clamp_numwant(Some(100_000)), DEFAULT_MAX_PEERS);
}

#[test]
fn sweep_deletes_empty_swarms() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Stopped);
    assert_eq!(registry.swarm_count(), 1);

    registry.sweep();
    assert_eq!(registry.swarm_count(), 0);
}

#[test]
fn announce_response_bencoding() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    let reply = announce(&registry, hash, peer_id(2), 100, AnnounceEvent::None);

    let body = encode_announce(&reply, false, true);
    let value = bencode::decode(&body).unwrap();
    assert_eq!(value.get(b"interval").and_then(|v| v.as_integer()), Some(1800));
    assert_eq!(value.get(b"min interval").and_then(|v| v.as_integer()), Some(300));
    assert_eq!(value.get(b"complete").and_then(|v| v.as_integer()), Some(1));
    assert_eq!(value.get(b"incomplete").and_then(|v| v.as_integer()), Some(1));

    let peers = value.get(b"peers").and_then(|v| v.as_list()).unwrap();
    assert_eq!(peers.len(), 1);
    let peer = &peers[0];
    assert_eq!(
        peer.get(b"peer id").and_then(|v| v.as_bytes()).map(|b| b.as_ref()),
        Some(peer_id(1).as_bytes().as_slice())
    );
    assert_eq!(peer.get(b"port").and_then(|v| v.as_integer()), Some(6881));
    assert!(peer.get(b"quality score").and_then(|v| v.as_float()).is_some());
    assert_eq!(peer.get(b"nerd balance").and_then(|v| v.as_integer()), Some(0));
}

#[test]
fn compact_response_is_six_bytes_per_peer() {
    let registry = registry(true);
    let hash = InfoHash::generate();

    announce(&registry, hash, peer_id(1), 0, AnnounceEvent::Started);
    let reply = announce(&registry, hash, peer_id(2), 100, AnnounceEvent::None);

    let body = encode_announce(&reply, true, true);
    let value = bencode::decode(&body).unwrap();
    let packed = value.get(b"peers").and_then(|v| v.as_bytes()).unwrap();
    assert_eq!(packed.len(), 6);
    assert_eq!(&packed[..4], &[10, 1, 2, 3]);
    assert_eq!(u16::from_be_bytes([packed[4], packed[5]]), 6881);
}

#[test]
fn failure_dictionary_shape() {
    let body = encode_failure("invalid info_hash");
    assert_eq!(body, b"d14:failure reason17:invalid info_hashe");
}

#[test]
fn query_parser_handles_binary_percent_escapes() {
    let params = parse_query("info_hash=%10%20%FF+x&port=6881&event=started");
    assert_eq!(params.len(), 3);
    assert_eq!(params[0].0, b"info_hash");
    assert_eq!(params[0].1, vec![0x10, 0x20, 0xFF, b' ', b'x']);
    assert_eq!(params[1], (b"port".to_vec(), b"6881".to_vec()));
    assert_eq!(params[2], (b"event".to_vec(), b"started".to_vec()));
}

fn src() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000)
}

fn connect(server: &UdpTrackerServer) -> u64 {
    let mut packet = Vec::new();
    packet.extend_from_slice(&0x41727101980u64.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&7u32.to_be_bytes());

    let reply = server.handle_packet(&packet, src()).unwrap();
    assert_eq!(&reply[..4], &0u32.to_be_bytes());
    assert_eq!(&reply[4..8], &7u32.to_be_bytes());
    u64::from_be_bytes(reply[8..16].try_into().unwrap())
}

#[test]
fn udp_connect_then_announce() {
    let server = UdpTrackerServer::new(Arc::new(registry(true)));
    let connection_id = connect(&server);

    let mut packet = Vec::new();
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&1u32.to_be_bytes());
    packet.extend_from_slice(&9u32.to_be_bytes());
    packet.extend_from_slice(peer_id(0).as_bytes()); // reuse as info hash bytes
    packet.extend_from_slice(peer_id(5).as_bytes());
    packet.extend_from_slice(&0u64.to_be_bytes()); // downloaded
    packet.extend_from_slice(&0u64.to_be_bytes()); // left: seeder
    packet.extend_from_slice(&0u64.to_be_bytes()); // uploaded
    packet.extend_from_slice(&2u32.to_be_bytes()); // started
    packet.extend_from_slice(&0u32.to_be_bytes()); // ip: use source
    packet.extend_from_slice(&0u32.to_be_bytes()); // key
    packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want default
    packet.extend_from_slice(&6881u16.to_be_bytes());
    assert_eq!(packet.len(), 98);

    let reply = server.handle_packet(&packet, src()).unwrap();
    assert_eq!(&reply[..4], &1u32.to_be_bytes());
    assert_eq!(&reply[4..8], &9u32.to_be_bytes());
    let interval = u32::from_be_bytes(reply[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(reply[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(reply[16..20].try_into().unwrap());
    assert_eq!(interval, 1800);
    assert_eq!(leechers, 0);
    assert_eq!(seeders, 1);
}

#[test]
fn udp_announce_without_connect_is_error() {
    let server = UdpTrackerServer::new(Arc::new(registry(true)));

    let mut packet = vec![0u8; 98];
    packet[8..12].copy_from_slice(&1u32.to_be_bytes());
    packet[12..16].copy_from_slice(&3u32.to_be_bytes());

    let reply = server.handle_packet(&packet, src()).unwrap();
    assert_eq!(&reply[..4], &3u32.to_be_bytes()); // error action
    assert_eq!(&reply[4..8], &3u32.to_be_bytes());
}

#[test]
fn udp_scrape_reports_counts() {
    let reg = Arc::new(registry(true));
    let hash = InfoHash::generate();
    announce(&reg, hash, peer_id(1), 0, AnnounceEvent::Started);
    announce(&reg, hash, peer_id(2), 10, AnnounceEvent::Started);

    let server = UdpTrackerServer::new(Arc::clone(&reg));
    let connection_id = connect(&server);

    let mut packet = Vec::new();
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&2u32.to_be_bytes());
    packet.extend_from_slice(&11u32.to_be_bytes());
    packet.extend_from_slice(hash.as_bytes());

    let reply = server.handle_packet(&packet, src()).unwrap();
    assert_eq!(&reply[..4], &2u32.to_be_bytes());
    let seeders = u32::from_be_bytes(reply[8..12].try_into().unwrap());
    let completed = u32::from_be_bytes(reply[12..16].try_into().unwrap());
    let leechers = u32::from_be_bytes(reply[16..20].try_into().unwrap());
    assert_eq!((seeders, completed, leechers), (1, 0, 1));
}

#[test]
fn udp_short_packet_ignored() {
    let server = UdpTrackerServer::new(Arc::new(registry(true)));
    assert!(server.handle_packet(&[0u8; 8], src()).is_none());
}
