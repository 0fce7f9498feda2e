use crate::dht::{Location, DEFAULT_QUALITY};
use crate::types::InfoHash;
use crate::wire::PeerId;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Seconds a well-behaved client waits between announces.
pub const ANNOUNCE_INTERVAL: u32 = 1800;
/// Floor on the re-announce interval.
pub const MIN_ANNOUNCE_INTERVAL: u32 = 300;
/// Upper bound on `numwant` and its default when absent.
pub const DEFAULT_MAX_PEERS: usize = 200;
/// Peers silent for this long are dropped by the sweep.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A peer as the tracker sees it.
#[derive(Debug, Clone)]
pub struct TrackerPeer {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub last_seen: Instant,
    pub is_seeder: bool,
    pub user_agent: Option<String>,
    pub quality_score: f64,
    pub token_balance: u64,
    pub location: Option<Location>,
}

impl TrackerPeer {
    /// Compact form: 4-byte IPv4 followed by the big-endian port. IPv6
    /// peers have no compact form.
    pub fn to_compact(&self) -> Option<[u8; 6]> {
        let IpAddr::V4(v4) = self.ip else {
            return None;
        };
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&v4.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        Some(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn parse(s: &str) -> Self {
        match s {
            "started" => AnnounceEvent::Started,
            "completed" => AnnounceEvent::Completed,
            "stopped" => AnnounceEvent::Stopped,
            _ => AnnounceEvent::None,
        }
    }

    /// BEP 15 event numbering.
    pub fn from_udp(id: u32) -> Self {
        match id {
            1 => AnnounceEvent::Completed,
            2 => AnnounceEvent::Started,
            3 => AnnounceEvent::Stopped,
            _ => AnnounceEvent::None,
        }
    }
}

/// A validated announce, whichever surface it arrived on.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: usize,
    pub user_agent: Option<String>,
}

/// What an announce returns to the client.
#[derive(Debug)]
pub struct AnnounceReply {
    pub interval: u32,
    pub min_interval: u32,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<TrackerPeer>,
}

/// Scrape counters for one info-hash.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeCounts {
    pub complete: u32,
    pub downloaded: u64,
    pub incomplete: u32,
}

/// Aggregate counters served by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub total_swarms: usize,
    pub total_peers: usize,
    pub total_seeders: usize,
    pub total_leechers: usize,
    pub total_completed: u64,
}

#[derive(Debug)]
struct Swarm {
    info_hash: InfoHash,
    peers: HashMap<PeerId, TrackerPeer>,
    created_at: Instant,
    last_update: Instant,
    seed_count: usize,
    leech_count: usize,
    completed_count: u64,
}

impl Swarm {
    fn new(info_hash: InfoHash) -> Self {
        let now = Instant::now();
        Self {
            info_hash,
            peers: HashMap::new(),
            created_at: now,
            last_update: now,
            seed_count: 0,
            leech_count: 0,
            completed_count: 0,
        }
    }

    /// Re-derives `seed_count`/`leech_count` from the peer map. A peer is a
    /// seeder iff `left == 0`.
    fn recount(&mut self) {
        self.seed_count = self.peers.values().filter(|p| p.is_seeder).count();
        self.leech_count = self.peers.len() - self.seed_count;
    }
}

/// The swarm registry behind both announce surfaces.
///
/// The top-level map takes its write lock only when creating or removing a
/// swarm; announces serialize per info-hash on the swarm's own mutex.
pub struct SwarmRegistry {
    swarms: RwLock<HashMap<InfoHash, Arc<Mutex<Swarm>>>>,
    nerd_enabled: bool,
    max_peers: usize,
    peer_timeout: Duration,
}

impl SwarmRegistry {
    pub fn new(nerd_enabled: bool, max_peers: usize, peer_timeout: Duration) -> Self {
        Self {
            swarms: RwLock::new(HashMap::new()),
            nerd_enabled,
            max_peers,
            peer_timeout,
        }
    }

    pub fn nerd_enabled(&self) -> bool {
        self.nerd_enabled
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Clamps a client-supplied `numwant` to `[1, max_peers]`; absent means
    /// the maximum.
    pub fn clamp_numwant(&self, numwant: Option<usize>) -> usize {
        match numwant {
            Some(n) => n.clamp(1, self.max_peers),
            None => self.max_peers,
        }
    }

    /// Applies one announce and selects peers for the reply.
    pub fn announce(&self, request: &AnnounceRequest) -> AnnounceReply {
        let swarm = self.swarm_for(request.info_hash);
        let mut swarm = swarm.lock();

        match request.event {
            AnnounceEvent::Stopped => {
                swarm.peers.remove(&request.peer_id);
                debug!(info_hash = %request.info_hash, peer = %request.peer_id, "peer stopped");
            }
            event => {
                if event == AnnounceEvent::Started {
                    info!(info_hash = %request.info_hash, peer = %request.peer_id, "peer started");
                }
                if event == AnnounceEvent::Completed {
                    swarm.completed_count += 1;
                }
                let peer = swarm
                    .peers
                    .entry(request.peer_id)
                    .or_insert_with(|| TrackerPeer {
                        peer_id: request.peer_id,
                        ip: request.ip,
                        port: request.port,
                        uploaded: 0,
                        downloaded: 0,
                        left: 0,
                        last_seen: Instant::now(),
                        is_seeder: false,
                        user_agent: None,
                        quality_score: DEFAULT_QUALITY,
                        token_balance: 0,
                        location: None,
                    });
                peer.ip = request.ip;
                peer.port = request.port;
                peer.uploaded = request.uploaded;
                peer.downloaded = request.downloaded;
                peer.left = request.left;
                peer.is_seeder = request.left == 0;
                peer.last_seen = Instant::now();
                if request.user_agent.is_some() {
                    peer.user_agent = request.user_agent.clone();
                }
            }
        }

        swarm.recount();
        swarm.last_update = Instant::now();

        let peers = self.select_peers(&swarm, &request.peer_id, request.numwant);
        AnnounceReply {
            interval: ANNOUNCE_INTERVAL,
            min_interval: MIN_ANNOUNCE_INTERVAL,
            complete: swarm.seed_count as u32,
            incomplete: swarm.leech_count as u32,
            peers,
        }
    }

    /// Picks up to `numwant` peers excluding the caller. With NERD enabled
    /// the order is quality descending, ties broken by peer id; otherwise
    /// uniformly random.
    fn select_peers(&self, swarm: &Swarm, exclude: &PeerId, numwant: usize) -> Vec<TrackerPeer> {
        let mut peers: Vec<TrackerPeer> = swarm
            .peers
            .values()
            .filter(|p| &p.peer_id != exclude)
            .cloned()
            .collect();

        if self.nerd_enabled {
            peers.sort_by(|a, b| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.peer_id.as_bytes().cmp(b.peer_id.as_bytes()))
            });
        } else {
            peers.shuffle(&mut rand::rng());
        }

        peers.truncate(numwant);
        peers
    }

    pub fn scrape(&self, info_hash: &InfoHash) -> Option<ScrapeCounts> {
        let swarm = self.swarms.read().get(info_hash).cloned()?;
        let swarm = swarm.lock();
        Some(ScrapeCounts {
            complete: swarm.seed_count as u32,
            downloaded: swarm.completed_count,
            incomplete: swarm.leech_count as u32,
        })
    }

    pub fn stats(&self) -> TrackerStats {
        let swarms: Vec<Arc<Mutex<Swarm>>> = self.swarms.read().values().cloned().collect();
        let mut stats = TrackerStats {
            total_swarms: swarms.len(),
            total_peers: 0,
            total_seeders: 0,
            total_leechers: 0,
            total_completed: 0,
        };
        for swarm in swarms {
            let swarm = swarm.lock();
            stats.total_peers += swarm.peers.len();
            stats.total_seeders += swarm.seed_count;
            stats.total_leechers += swarm.leech_count;
            stats.total_completed += swarm.completed_count;
        }
        stats
    }

    /// Applies a quality score to a peer wherever it appears.
    pub fn update_peer_quality(&self, peer_id: &PeerId, quality_score: f64) {
        let swarms: Vec<Arc<Mutex<Swarm>>> = self.swarms.read().values().cloned().collect();
        for swarm in swarms {
            let mut swarm = swarm.lock();
            if let Some(peer) = swarm.peers.get_mut(peer_id) {
                peer.quality_score = quality_score.clamp(0.0, 1.0);
            }
        }
    }

    pub fn update_peer_balance(&self, peer_id: &PeerId, balance: u64) {
        let swarms: Vec<Arc<Mutex<Swarm>>> = self.swarms.read().values().cloned().collect();
        for swarm in swarms {
            let mut swarm = swarm.lock();
            if let Some(peer) = swarm.peers.get_mut(peer_id) {
                peer.token_balance = balance;
            }
        }
    }

    /// Evicts peers idle past the timeout and deletes swarms that emptied
    /// out. Returns how many peers were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        let mut empty: Vec<InfoHash> = Vec::new();

        {
            let swarms = self.swarms.read();
            for (info_hash, swarm) in swarms.iter() {
                let mut swarm = swarm.lock();
                let before = swarm.peers.len();
                let timeout = self.peer_timeout;
                swarm.peers.retain(|_, p| p.last_seen.elapsed() < timeout);
                removed += before - swarm.peers.len();
                swarm.recount();
                if swarm.peers.is_empty() {
                    debug!(
                        info_hash = %swarm.info_hash,
                        age_secs = swarm.created_at.elapsed().as_secs(),
                        "removing empty swarm"
                    );
                    empty.push(*info_hash);
                }
            }
        }

        if !empty.is_empty() {
            let mut swarms = self.swarms.write();
            for info_hash in empty {
                // Re-check under the write lock; an announce may have raced in.
                let still_empty = swarms
                    .get(&info_hash)
                    .map(|s| s.lock().peers.is_empty())
                    .unwrap_or(false);
                if still_empty {
                    swarms.remove(&info_hash);
                }
            }
        }

        if removed > 0 {
            debug!(removed, "tracker sweep evicted idle peers");
        }
        removed
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.read().len()
    }

    /// For invariant checks: the (seed, leech, total) counters of a swarm.
    #[cfg(test)]
    pub fn swarm_counts(&self, info_hash: &InfoHash) -> Option<(usize, usize, usize)> {
        let swarm = self.swarms.read().get(info_hash).cloned()?;
        let swarm = swarm.lock();
        Some((swarm.seed_count, swarm.leech_count, swarm.peers.len()))
    }

    fn swarm_for(&self, info_hash: InfoHash) -> Arc<Mutex<Swarm>> {
        if let Some(swarm) = self.swarms.read().get(&info_hash) {
            return Arc::clone(swarm);
        }
        let mut swarms = self.swarms.write();
        Arc::clone(
            swarms
                .entry(info_hash)
                .or_insert_with(|| Arc::new(Mutex::new(Swarm::new(info_hash)))),
        )
    }
}
