use super::error::DhtError;
use super::krpc::{KrpcMessage, KrpcQuery, KrpcResponse, TransactionId};
use super::node::{NodeEntry, NodeId};
use super::peers::PeerStore;
use super::routing::{InsertOutcome, RoutingTable, K};
use crate::types::InfoHash;
use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const LOOKUP_DEADLINE: Duration = Duration::from_secs(30);
const BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ALPHA: usize = 3;
const MAX_PENDING_QUERIES: usize = 100;
const MAX_ANNOUNCES_PER_HASH: usize = 1000;
const ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Tracks the iterative-lookup working set: the K closest nodes seen so
/// far, which of them were already queried, and the peers accumulated along
/// the way.
///
/// The state is deliberately free of I/O so convergence is testable against
/// a simulated network.
pub struct LookupState {
    target: NodeId,
    shortlist: Vec<NodeEntry>,
    queried: HashSet<NodeId>,
    best_before_round: Option<[u8; 20]>,
    peers: Vec<SocketAddr>,
}

impl LookupState {
    pub fn new(target: NodeId, seeds: Vec<NodeEntry>) -> Self {
        let mut state = Self {
            target,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            best_before_round: None,
            peers: Vec::new(),
        };
        state.add_nodes(seeds);
        state
    }

    /// Inserts candidate nodes, keeping the shortlist sorted by distance and
    /// bounded to a few multiples of K.
    pub fn add_nodes(&mut self, nodes: Vec<NodeEntry>) {
        for node in nodes {
            if self.shortlist.iter().any(|n| n.id == node.id) {
                continue;
            }
            self.shortlist.push(node);
        }
        let target = self.target;
        self.shortlist
            .sort_by(|a, b| a.id.distance(&target).cmp(&b.id.distance(&target)));
        self.shortlist.truncate(K * 4);
    }

    pub fn add_peers(&mut self, peers: Vec<SocketAddr>) {
        for peer in peers {
            if !self.peers.contains(&peer) {
                self.peers.push(peer);
            }
        }
    }

    /// Picks the next `alpha` closest un-queried nodes and marks a round as
    /// started. Empty means the lookup is exhausted.
    pub fn next_batch(&mut self, alpha: usize) -> Vec<NodeEntry> {
        self.best_before_round = self.best_distance();
        let batch: Vec<NodeEntry> = self
            .shortlist
            .iter()
            .filter(|n| !self.queried.contains(&n.id))
            .take(alpha)
            .cloned()
            .collect();
        for node in &batch {
            self.queried.insert(node.id);
        }
        batch
    }

    /// True when the round that just finished brought nothing closer.
    pub fn converged(&self) -> bool {
        match (self.best_before_round, self.best_distance()) {
            (Some(before), Some(after)) => after >= before,
            (None, _) => false,
            (_, None) => true,
        }
    }

    pub fn closest(&self, count: usize) -> Vec<NodeEntry> {
        self.shortlist.iter().take(count).cloned().collect()
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn into_peers(self) -> Vec<SocketAddr> {
        self.peers
    }

    fn best_distance(&self) -> Option<[u8; 20]> {
        self.shortlist.first().map(|n| n.id.distance(&self.target))
    }
}

/// Result of an iterative `find_peers` lookup.
pub struct LookupResult {
    pub peers: Vec<SocketAddr>,
    /// The closest responding nodes with the announce tokens they handed
    /// out.
    pub closest: Vec<(NodeEntry, Option<Bytes>)>,
}

struct PendingQuery {
    sender: mpsc::Sender<KrpcResponse>,
}

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

struct AnnounceEntry {
    addr: SocketAddr,
    at: Instant,
}

#[derive(Default)]
struct AnnounceStore {
    by_hash: HashMap<InfoHash, Vec<AnnounceEntry>>,
}

impl AnnounceStore {
    fn add(&mut self, info_hash: InfoHash, addr: SocketAddr) {
        let entries = self.by_hash.entry(info_hash).or_default();
        entries.retain(|e| e.at.elapsed() < ANNOUNCE_LIFETIME && e.addr != addr);
        if entries.len() < MAX_ANNOUNCES_PER_HASH {
            entries.push(AnnounceEntry {
                addr,
                at: Instant::now(),
            });
        }
    }

    fn get(&mut self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        match self.by_hash.get_mut(info_hash) {
            Some(entries) => {
                entries.retain(|e| e.at.elapsed() < ANNOUNCE_LIFETIME);
                entries.iter().map(|e| e.addr).collect()
            }
            None => Vec::new(),
        }
    }

    fn sweep(&mut self) {
        self.by_hash.retain(|_, entries| {
            entries.retain(|e| e.at.elapsed() < ANNOUNCE_LIFETIME);
            !entries.is_empty()
        });
    }
}

/// Counters reported by the maintenance loop and the supervisor.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub nodes: usize,
    pub populated_buckets: usize,
    pub known_peers: usize,
    pub metrics_cached: usize,
    pub pending_queries: usize,
}

/// The DHT node: UDP transport, routing table, peer store and the KRPC
/// request/response machinery.
pub struct DhtServer {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    routing: Arc<RoutingTable>,
    peer_store: Arc<PeerStore>,
    announces: RwLock<AnnounceStore>,
    pending: RwLock<HashMap<TransactionId, PendingQuery>>,
    tokens: RwLock<TokenSecrets>,
    port: u16,
}

impl DhtServer {
    pub async fn bind(port: u16) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_addr = socket.local_addr()?;
        let local_id = NodeId::generate();

        info!(addr = %local_addr, id = %local_id, "dht bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_id,
            routing: Arc::new(RoutingTable::new(local_id)),
            peer_store: Arc::new(PeerStore::new()),
            announces: RwLock::new(AnnounceStore::default()),
            pending: RwLock::new(HashMap::new()),
            tokens: RwLock::new(TokenSecrets::new()),
            port: local_addr.port(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    pub fn stats(&self) -> DhtStats {
        DhtStats {
            nodes: self.routing.node_count(),
            populated_buckets: self.routing.populated_buckets(),
            known_peers: self.peer_store.len(),
            metrics_cached: self.peer_store.metrics_cached(),
            pending_queries: self.pending.read().len(),
        }
    }

    /// Resolves the configured bootstrap endpoints and walks `find_node`
    /// toward our own id until the table fills out or the deadline passes.
    pub async fn bootstrap(self: &Arc<Self>, bootstrap_nodes: &[String]) -> Result<(), DhtError> {
        let deadline = Instant::now() + BOOTSTRAP_DEADLINE;

        for endpoint in bootstrap_nodes {
            match tokio::net::lookup_host(endpoint.as_str()).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                        debug!(%addr, "pinging bootstrap node");
                        if let Err(err) = self.ping(addr).await {
                            debug!(%addr, error = %err, "bootstrap ping failed");
                        }
                    }
                }
                Err(err) => warn!(endpoint, error = %err, "failed to resolve bootstrap node"),
            }
        }

        let seeds = self.routing.find_closest(&self.local_id, K);
        if seeds.is_empty() {
            return Err(DhtError::Bootstrap("no bootstrap node responded".into()));
        }

        let mut state = LookupState::new(self.local_id, seeds);
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let batch = state.next_batch(ALPHA);
            if batch.is_empty() {
                break;
            }
            let query = KrpcQuery::FindNode {
                target: self.local_id,
            };
            let results = self.query_batch(&batch, query).await;
            for (node, result) in results {
                match result {
                    Ok(KrpcResponse::Nodes { nodes, .. }) => state.add_nodes(nodes),
                    Ok(_) => {}
                    Err(_) => self.routing.mark_failed(&node.id),
                }
            }
            if state.converged() {
                break;
            }
        }

        info!(
            nodes = self.routing.node_count(),
            buckets = self.routing.populated_buckets(),
            "dht bootstrap complete"
        );
        Ok(())
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<KrpcResponse, DhtError> {
        self.send_query(addr, KrpcQuery::Ping).await
    }

    /// Iterative node lookup toward `target`, refreshing the covering
    /// bucket.
    pub async fn find_node(self: &Arc<Self>, target: NodeId) -> Result<Vec<NodeEntry>, DhtError> {
        let seeds = self.routing.find_closest(&target, K);
        let mut state = LookupState::new(target, seeds);
        let deadline = Instant::now() + LOOKUP_DEADLINE;

        while Instant::now() < deadline {
            let batch = state.next_batch(ALPHA);
            if batch.is_empty() {
                break;
            }
            let results = self.query_batch(&batch, KrpcQuery::FindNode { target }).await;
            for (node, result) in results {
                match result {
                    Ok(KrpcResponse::Nodes { nodes, .. }) => state.add_nodes(nodes),
                    Ok(_) => {}
                    Err(_) => self.routing.mark_failed(&node.id),
                }
            }
            if state.converged() {
                break;
            }
        }

        self.routing.note_refreshed(&target);
        Ok(state.closest(K))
    }

    /// Iterative `find_peers`: walks `get_peers` queries toward the
    /// info-hash, accumulating peers and announce tokens, until a round
    /// brings nothing closer or the 30-second deadline elapses.
    pub async fn find_peers(self: &Arc<Self>, info_hash: InfoHash) -> Result<LookupResult, DhtError> {
        let target = NodeId(*info_hash.as_bytes());
        let seeds = self.routing.find_closest(&target, K);
        let mut state = LookupState::new(target, seeds);
        let mut tokens: HashMap<NodeId, Bytes> = HashMap::new();
        let deadline = Instant::now() + LOOKUP_DEADLINE;

        while Instant::now() < deadline {
            let batch = state.next_batch(ALPHA);
            if batch.is_empty() {
                break;
            }
            let results = self
                .query_batch(&batch, KrpcQuery::GetPeers { info_hash })
                .await;
            for (node, result) in results {
                match result {
                    Ok(KrpcResponse::Peers {
                        id,
                        token,
                        peers,
                        nodes,
                    }) => {
                        tokens.insert(id, token);
                        state.add_peers(peers);
                        state.add_nodes(nodes);
                    }
                    Ok(KrpcResponse::Nodes { nodes, .. }) => state.add_nodes(nodes),
                    Ok(_) => {}
                    Err(_) => self.routing.mark_failed(&node.id),
                }
            }
            if state.converged() {
                break;
            }
        }

        self.routing.note_refreshed(&target);

        let closest = state
            .closest(K)
            .into_iter()
            .map(|node| {
                let token = tokens.get(&node.id).cloned();
                (node, token)
            })
            .collect();

        for peer in state.peers() {
            self.peer_store.observe(*peer, None);
        }

        Ok(LookupResult {
            peers: state.into_peers(),
            closest,
        })
    }

    /// Announces the local node for `info_hash` on `port`: a lookup
    /// followed by `announce_peer` to the K closest token-bearing nodes.
    pub async fn announce(self: &Arc<Self>, info_hash: InfoHash, port: u16) -> Result<usize, DhtError> {
        let result = self.find_peers(info_hash).await?;

        let mut announced = 0;
        for (node, token) in result.closest {
            let Some(token) = token else { continue };
            let query = KrpcQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            };
            match self.send_query(node.addr, query).await {
                Ok(_) => announced += 1,
                Err(err) => debug!(addr = %node.addr, error = %err, "announce_peer failed"),
            }
        }

        info!(info_hash = %info_hash, announced, "dht announce complete");
        Ok(announced)
    }

    /// Key/value storage over the DHT. The transport speaks only the four
    /// mainline methods today, so this reports itself unimplemented and
    /// callers must cope.
    pub fn store_value(&self, _key: InfoHash, _value: &[u8]) -> Result<(), DhtError> {
        Err(DhtError::NotImplemented)
    }

    pub fn retrieve_value(&self, _key: InfoHash) -> Result<Vec<u8>, DhtError> {
        Err(DhtError::NotImplemented)
    }

    async fn query_batch(
        self: &Arc<Self>,
        batch: &[NodeEntry],
        query: KrpcQuery,
    ) -> Vec<(NodeEntry, Result<KrpcResponse, DhtError>)> {
        let futures = batch.iter().map(|node| {
            let node = node.clone();
            let query = query.clone();
            async move {
                let result = self.send_query(node.addr, query).await;
                (node, result)
            }
        });
        futures::future::join_all(futures).await
    }

    /// Sends one query and waits for the matching response or the 30-second
    /// deadline. The response demultiplexer hands the reply over by
    /// transaction id.
    pub async fn send_query(
        &self,
        addr: SocketAddr,
        query: KrpcQuery,
    ) -> Result<KrpcResponse, DhtError> {
        let (tx, mut rx) = mpsc::channel(1);
        let tid = {
            let mut pending = self.pending.write();
            if pending.len() >= MAX_PENDING_QUERIES {
                return Err(DhtError::RateLimited);
            }
            let mut tid;
            loop {
                let raw: [u8; 2] = rand::random();
                tid = Bytes::copy_from_slice(&raw);
                if !pending.contains_key(&tid) {
                    break;
                }
            }
            pending.insert(tid.clone(), PendingQuery { sender: tx });
            tid
        };

        let message = KrpcMessage::Query {
            transaction_id: tid.clone(),
            sender_id: self.local_id,
            query,
        };

        let send_result = self.socket.send_to(&message.encode(), addr).await;
        if let Err(err) = send_result {
            self.pending.write().remove(&tid);
            return Err(err.into());
        }

        let result = timeout(QUERY_TIMEOUT, rx.recv()).await;
        self.pending.write().remove(&tid);

        match result {
            Ok(Some(response)) => Ok(response),
            _ => Err(DhtError::Timeout),
        }
    }

    /// Drives the socket and the periodic maintenance work. Runs until the
    /// task is cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65_535];
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.tick().await;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = result?;
                    match KrpcMessage::parse(&buf[..n]) {
                        Ok(message) => self.handle_message(message, addr).await,
                        Err(err) => debug!(%addr, error = %err, "bad krpc datagram"),
                    }
                }
                _ = maintenance.tick() => {
                    self.maintain().await;
                }
            }
        }
    }

    async fn maintain(self: &Arc<Self>) {
        self.tokens.write().rotate();
        self.announces.write().sweep();

        let evicted = self.peer_store.sweep();
        if evicted > 0 {
            debug!(evicted, "swept idle peers");
        }

        let stale = self.routing.stale_buckets();
        for idx in stale {
            let target = self.routing.random_id_in_bucket(idx);
            if let Err(err) = self.find_node(target).await {
                debug!(bucket = idx, error = %err, "bucket refresh failed");
            }
        }

        let stats = self.stats();
        info!(
            nodes = stats.nodes,
            peers = stats.known_peers,
            pending = stats.pending_queries,
            "dht maintenance"
        );
    }

    async fn handle_message(self: &Arc<Self>, message: KrpcMessage, addr: SocketAddr) {
        if let Some(id) = message.sender_id() {
            self.observe_node(NodeEntry::new(id, addr));
        }

        match message {
            KrpcMessage::Response {
                transaction_id,
                response,
            } => {
                let pending = self.pending.read();
                if let Some(query) = pending.get(&transaction_id) {
                    let _ = query.sender.try_send(response);
                }
            }
            KrpcMessage::Query {
                transaction_id,
                query,
                ..
            } => {
                if let Some(reply) = self.answer(transaction_id, query, addr) {
                    let _ = self.socket.send_to(&reply.encode(), addr).await;
                }
            }
        }
    }

    fn answer(
        &self,
        transaction_id: TransactionId,
        query: KrpcQuery,
        addr: SocketAddr,
    ) -> Option<KrpcMessage> {
        let response = match query {
            KrpcQuery::Ping => KrpcResponse::Pong { id: self.local_id },
            KrpcQuery::FindNode { target } => KrpcResponse::Nodes {
                id: self.local_id,
                nodes: self.routing.find_closest(&target, K),
            },
            KrpcQuery::GetPeers { info_hash } => {
                let target = NodeId(*info_hash.as_bytes());
                KrpcResponse::Peers {
                    id: self.local_id,
                    token: self.mint_token(&addr),
                    peers: self.announces.write().get(&info_hash),
                    nodes: self.routing.find_closest(&target, K),
                }
            }
            KrpcQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.check_token(&addr, &token) {
                    debug!(%addr, "announce_peer with invalid token");
                    KrpcResponse::Error {
                        code: 203,
                        message: "Invalid token".to_string(),
                    }
                } else {
                    let peer_port = if implied_port { addr.port() } else { port };
                    let peer_addr = SocketAddr::new(addr.ip(), peer_port);
                    self.announces.write().add(info_hash, peer_addr);
                    self.peer_store.observe(peer_addr, None);
                    debug!(peer = %peer_addr, info_hash = %info_hash, "stored announce");
                    KrpcResponse::Announced { id: self.local_id }
                }
            }
        };

        Some(KrpcMessage::Response {
            transaction_id,
            response,
        })
    }

    /// Offers a node to the routing table; a full bucket triggers a liveness
    /// probe of its least-recently-seen occupant.
    fn observe_node(self: &Arc<Self>, entry: NodeEntry) {
        if let InsertOutcome::Probe(lru) = self.routing.insert(entry) {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                for _ in 0..super::node::MAX_FAILURES {
                    match server.ping(lru.addr).await {
                        Ok(_) => {
                            server.routing.mark_seen(&lru.id);
                            return;
                        }
                        Err(_) => server.routing.mark_failed(&lru.id),
                    }
                }
            });
        }
    }

    fn mint_token(&self, addr: &SocketAddr) -> Bytes {
        token_for(&self.tokens.read().current, addr)
    }

    /// Tokens bind to the requester's endpoint and stay valid across one
    /// rotation (ten minutes).
    fn check_token(&self, addr: &SocketAddr, token: &Bytes) -> bool {
        let secrets = self.tokens.read();
        token == &token_for(&secrets.current, addr) || token == &token_for(&secrets.previous, addr)
    }
}

fn token_for(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().to_string().as_bytes());
    let digest = hasher.finalize();
    Bytes::copy_from_slice(&digest[..8])
}
