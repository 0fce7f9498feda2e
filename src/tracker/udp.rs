use super::error::TrackerError;
use super::swarm::{AnnounceEvent, AnnounceRequest, SwarmRegistry};
use crate::types::InfoHash;
use crate::wire::PeerId;
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;
const CONNECTION_TTL: Duration = Duration::from_secs(120);
const ANNOUNCE_PACKET_LEN: usize = 98;

/// The BEP 15 UDP announce surface.
///
/// Clients first `connect` to obtain a connection id, valid for two
/// minutes, which authorizes their announce and scrape packets.
pub struct UdpTrackerServer {
    registry: Arc<SwarmRegistry>,
    connections: Mutex<HashMap<u64, Instant>>,
}

impl UdpTrackerServer {
    pub fn new(registry: Arc<SwarmRegistry>) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn serve(self: Arc<Self>, port: u16) -> Result<(), TrackerError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(TrackerError::ListenerBind)?;
        info!(port, "tracker udp listening");

        let mut buf = vec![0u8; 2048];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            if let Some(reply) = self.handle_packet(&buf[..n], src) {
                let _ = socket.send_to(&reply, src).await;
            }
        }
    }

    /// Processes one datagram and builds the reply, if any. Split from the
    /// socket loop so the packet handling is testable.
    pub fn handle_packet(&self, data: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        if data.len() < 16 {
            return None;
        }

        let mut cursor = data;
        let connection_or_magic = cursor.get_u64();
        let action = cursor.get_u32();
        let transaction_id = cursor.get_u32();

        match action {
            ACTION_CONNECT => {
                if connection_or_magic != PROTOCOL_MAGIC {
                    return Some(error_reply(transaction_id, "bad protocol magic"));
                }
                let connection_id = self.mint_connection();
                let mut reply = Vec::with_capacity(16);
                reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                reply.extend_from_slice(&transaction_id.to_be_bytes());
                reply.extend_from_slice(&connection_id.to_be_bytes());
                Some(reply)
            }
            ACTION_ANNOUNCE => {
                if !self.connection_valid(connection_or_magic) {
                    return Some(error_reply(transaction_id, "invalid connection id"));
                }
                if data.len() < ANNOUNCE_PACKET_LEN {
                    return Some(error_reply(transaction_id, "announce packet too short"));
                }
                Some(self.handle_announce(cursor, transaction_id, src))
            }
            ACTION_SCRAPE => {
                if !self.connection_valid(connection_or_magic) {
                    return Some(error_reply(transaction_id, "invalid connection id"));
                }
                Some(self.handle_scrape(cursor, transaction_id))
            }
            other => {
                debug!(action = other, %src, "unknown udp tracker action");
                None
            }
        }
    }

    fn handle_announce(&self, mut cursor: &[u8], transaction_id: u32, src: SocketAddr) -> Vec<u8> {
        let info_hash = InfoHash::from_bytes(&cursor[..20]).expect("20 bytes");
        cursor.advance(20);
        let peer_id = PeerId::from_bytes(&cursor[..20]).expect("20 bytes");
        cursor.advance(20);

        let downloaded = cursor.get_u64();
        let left = cursor.get_u64();
        let uploaded = cursor.get_u64();
        let event = AnnounceEvent::from_udp(cursor.get_u32());
        let ip_raw = cursor.get_u32();
        let _key = cursor.get_u32();
        let num_want = cursor.get_i32();
        let port = cursor.get_u16();

        let ip = if ip_raw == 0 {
            src.ip()
        } else {
            IpAddr::V4(Ipv4Addr::from(ip_raw))
        };

        let numwant = if num_want > 0 {
            Some(num_want as usize)
        } else {
            None
        };

        let request = AnnounceRequest {
            info_hash,
            peer_id,
            ip,
            port,
            uploaded,
            downloaded,
            left,
            event,
            numwant: self.registry.clamp_numwant(numwant),
            user_agent: None,
        };
        let reply = self.registry.announce(&request);

        let mut out = Vec::with_capacity(20 + reply.peers.len() * 6);
        out.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        out.extend_from_slice(&transaction_id.to_be_bytes());
        out.extend_from_slice(&reply.interval.to_be_bytes());
        out.extend_from_slice(&reply.incomplete.to_be_bytes());
        out.extend_from_slice(&reply.complete.to_be_bytes());
        for peer in &reply.peers {
            if let Some(compact) = peer.to_compact() {
                out.extend_from_slice(&compact);
            }
        }
        out
    }

    fn handle_scrape(&self, mut cursor: &[u8], transaction_id: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + (cursor.len() / 20) * 12);
        out.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        out.extend_from_slice(&transaction_id.to_be_bytes());

        while cursor.len() >= 20 {
            let info_hash = InfoHash::from_bytes(&cursor[..20]).expect("20 bytes");
            cursor.advance(20);

            let (seeders, completed, leechers) = match self.registry.scrape(&info_hash) {
                Some(counts) => (counts.complete, counts.downloaded as u32, counts.incomplete),
                None => (0, 0, 0),
            };
            out.extend_from_slice(&seeders.to_be_bytes());
            out.extend_from_slice(&completed.to_be_bytes());
            out.extend_from_slice(&leechers.to_be_bytes());
        }
        out
    }

    fn mint_connection(&self) -> u64 {
        let mut connections = self.connections.lock();
        connections.retain(|_, issued| issued.elapsed() < CONNECTION_TTL);
        let id: u64 = rand::random();
        connections.insert(id, Instant::now());
        id
    }

    fn connection_valid(&self, id: u64) -> bool {
        self.connections
            .lock()
            .get(&id)
            .is_some_and(|issued| issued.elapsed() < CONNECTION_TTL)
    }
}

fn error_reply(transaction_id: u32, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + message.len());
    out.extend_from_slice(&ACTION_ERROR.to_be_bytes());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}
