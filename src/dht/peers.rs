use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::node::NodeId;

/// Default score for peers we have no metrics on.
pub const DEFAULT_QUALITY: f64 = 0.5;

const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_RESPONSE_TIME_MS: f64 = 5_000.0;

/// Rough geographic placement a peer volunteered about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub country_code: String,
    pub city: String,
}

/// Detailed performance data behind a peer's derived quality score.
#[derive(Debug, Clone)]
pub struct QualityMetrics {
    pub response_time_ms: u64,
    pub reliability: f64,
    pub bandwidth_score: f64,
    pub uptime_pct: f64,
    pub last_updated: Instant,
}

impl QualityMetrics {
    /// Folds the metrics into the scalar score in [0, 1]:
    /// response time 30%, reliability 40%, bandwidth 20%, uptime 10%.
    pub fn score(&self) -> f64 {
        let rt = (self.response_time_ms as f64 / MAX_RESPONSE_TIME_MS).min(1.0);
        let score = 0.3 * (1.0 - rt)
            + 0.4 * self.reliability
            + 0.2 * self.bandwidth_score
            + 0.1 * self.uptime_pct;
        score.clamp(0.0, 1.0)
    }

    /// Builds metrics from the fields a quality-metrics wire message
    /// carries. Response time is not on the wire, so a nominal 100 ms is
    /// assumed; bandwidth normalizes against 100 Mbps and uptime against a
    /// full day.
    pub fn from_wire(uptime_secs: u64, reliability: f64, upload_mbps: u32) -> Self {
        Self {
            response_time_ms: 100,
            reliability: reliability.clamp(0.0, 1.0),
            bandwidth_score: (f64::from(upload_mbps) / 100.0).min(1.0),
            uptime_pct: (uptime_secs as f64 / 86_400.0).min(1.0),
            last_updated: Instant::now(),
        }
    }
}

/// What the node knows about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub endpoint: SocketAddr,
    pub node_id: Option<NodeId>,
    pub quality_score: f64,
    pub last_seen: Instant,
    pub first_seen: Instant,
    pub location: Option<Location>,
    pub token_balance: u64,
}

impl PeerRecord {
    fn new(endpoint: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            endpoint,
            node_id: None,
            quality_score: DEFAULT_QUALITY,
            last_seen: now,
            first_seen: now,
            location: None,
            token_balance: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.first_seen.elapsed()
    }
}

/// In-memory store of discovered peers with their quality cache.
///
/// The store exclusively owns peer records; sessions and the tracker post
/// updates through the DHT server rather than holding references in.
pub struct PeerStore {
    peers: RwLock<HashMap<SocketAddr, PeerRecord>>,
    metrics: RwLock<HashMap<SocketAddr, QualityMetrics>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or refreshes a peer by endpoint, bumping `last_seen`.
    pub fn observe(&self, endpoint: SocketAddr, node_id: Option<NodeId>) {
        let mut peers = self.peers.write();
        let record = peers.entry(endpoint).or_insert_with(|| PeerRecord::new(endpoint));
        record.last_seen = Instant::now();
        if node_id.is_some() {
            record.node_id = node_id;
        }
    }

    /// Applies fresh metrics and recomputes the derived score.
    pub fn update_quality(&self, endpoint: SocketAddr, metrics: QualityMetrics) {
        let score = metrics.score();
        self.metrics.write().insert(endpoint, metrics);

        let mut peers = self.peers.write();
        let record = peers.entry(endpoint).or_insert_with(|| PeerRecord::new(endpoint));
        record.quality_score = score;
        record.last_seen = Instant::now();
    }

    pub fn update_location(&self, endpoint: SocketAddr, location: Location) {
        let mut peers = self.peers.write();
        let record = peers.entry(endpoint).or_insert_with(|| PeerRecord::new(endpoint));
        record.location = Some(location);
        record.last_seen = Instant::now();
    }

    pub fn update_token_balance(&self, endpoint: SocketAddr, balance: u64) {
        let mut peers = self.peers.write();
        let record = peers.entry(endpoint).or_insert_with(|| PeerRecord::new(endpoint));
        record.token_balance = balance;
        record.last_seen = Instant::now();
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<PeerRecord> {
        self.peers.read().get(endpoint).cloned()
    }

    /// All peers with a quality score of at least `min_quality`.
    pub fn peers_above(&self, min_quality: f64) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|p| p.quality_score >= min_quality)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn metrics_cached(&self) -> usize {
        self.metrics.read().len()
    }

    /// Drops peers idle past the 30-minute window; returns how many went.
    pub fn sweep(&self) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| p.last_seen.elapsed() < PEER_IDLE_TIMEOUT);

        let mut metrics = self.metrics.write();
        metrics.retain(|endpoint, _| peers.contains_key(endpoint));

        before - peers.len()
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}
