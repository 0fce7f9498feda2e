//! Node supervisor.
//!
//! Boots the enabled subsystems, owns the wire listener and the live
//! session registry, routes session events to the DHT peer store and the
//! payment coordinator, and drives the periodic announce, discovery and
//! statistics loops. Components receive explicit injected registries; the
//! only paths between them are command and event channels.

use crate::config::Config;
use crate::dht::{DhtError, DhtServer, Location, QualityMetrics};
use crate::payments::{PaymentCoordinator, PaymentError, PaymentRequest};
use crate::tracker::{
    self, SwarmRegistry, TrackerError, UdpTrackerServer, DEFAULT_MAX_PEERS, DEFAULT_PEER_TIMEOUT,
};
use crate::types::InfoHash;
use crate::wire::{session, Message, PeerId, SessionEvent, SessionHandle, SessionSender};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Info-hash under which wire sessions handshake.
const WIRE_INFO_HASH: [u8; 20] = *b"NERD_DAEMON_HASH____";
/// Info-hash the daemon announces for network-wide discovery.
const NETWORK_INFO_HASH: [u8; 20] = *b"NERD_DAEMON_NETWORK_";

const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TRACKER_STATS_INTERVAL: Duration = Duration::from_secs(10 * 60);
const PAYMENT_STATS_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DIAL_RETRIES: u32 = 3;
const DIAL_BACKOFF: Duration = Duration::from_secs(5);
/// Discovered peers above this quality are worth dialing.
const DIAL_QUALITY_FLOOR: f64 = 0.7;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind listener: {0}")]
    ListenerBind(std::io::Error),

    #[error("dht error: {0}")]
    Dht(#[from] DhtError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),
}

/// The running daemon.
pub struct Node {
    config: Config,
    peer_id: PeerId,
    dht: Option<Arc<DhtServer>>,
    tracker: Option<Arc<SwarmRegistry>>,
    payments: Option<Arc<PaymentCoordinator>>,
    sessions: Arc<DashMap<SocketAddr, SessionHandle>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Builds the node: binds the DHT socket, parses the payment key.
    /// Init-time failures here are fatal.
    pub async fn new(config: Config) -> Result<Self, NodeError> {
        let peer_id = PeerId::generate();
        info!(peer_id = %peer_id, "node identity generated");

        let dht = if config.enable_dht {
            Some(Arc::new(DhtServer::bind(config.dht_port).await?))
        } else {
            info!("dht disabled");
            None
        };

        let tracker = if config.enable_tracker {
            Some(Arc::new(SwarmRegistry::new(
                true,
                DEFAULT_MAX_PEERS,
                DEFAULT_PEER_TIMEOUT,
            )))
        } else {
            info!("tracker disabled");
            None
        };

        let payments = if !config.enable_bsv {
            info!("payments disabled");
            None
        } else if !config.bsv_payment.has_usable_key() {
            warn!("payment key missing or placeholder, payments will not function");
            None
        } else {
            Some(Arc::new(PaymentCoordinator::new(config.bsv_payment.clone())?))
        };

        let (events_tx, events_rx) = mpsc::channel(1024);

        Ok(Self {
            config,
            peer_id,
            dht,
            tracker,
            payments,
            sessions: Arc::new(DashMap::new()),
            events_tx,
            events_rx,
            tasks: Vec::new(),
        })
    }

    /// Runs the node until interrupted.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(NodeError::ListenerBind)?;
        info!(port = self.config.port, "wire listener ready");

        self.spawn_dht_tasks();
        self.spawn_tracker_tasks();
        self.spawn_payment_tasks();
        self.dial_configured_peers();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound connection");
                            let events = self.events_tx.clone();
                            let peer_id = self.peer_id;
                            let sessions = Arc::clone(&self.sessions);
                            tokio::spawn(async move {
                                match session::accept(stream, InfoHash(WIRE_INFO_HASH), peer_id, events).await {
                                    Ok(handle) => {
                                        sessions.insert(addr, handle);
                                    }
                                    Err(err) => warn!(%addr, error = %err, "inbound handshake failed"),
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("node stopped");
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Established { addr, peer_id, .. } => {
                info!(%addr, peer = %peer_id, sessions = self.sessions.len(), "session established");
                if let Some(dht) = &self.dht {
                    dht.peer_store().observe(addr, None);
                }
            }
            SessionEvent::Closed { addr, reason } => {
                self.sessions.remove(&addr);
                debug!(%addr, ?reason, "session removed");
            }
            SessionEvent::QualityMetrics {
                addr,
                uptime_secs,
                reliability,
                upload_mbps,
                ..
            } => {
                if let Some(dht) = &self.dht {
                    dht.peer_store().update_quality(
                        addr,
                        QualityMetrics::from_wire(uptime_secs, reliability, upload_mbps),
                    );
                }
            }
            SessionEvent::GeographicHint {
                addr,
                country_code,
                city,
            } => {
                if let Some(dht) = &self.dht {
                    dht.peer_store()
                        .update_location(addr, Location { country_code, city });
                }
            }
            SessionEvent::TokenBalance { addr, balance, .. } => {
                if let Some(dht) = &self.dht {
                    dht.peer_store().update_token_balance(addr, balance);
                }
            }
            SessionEvent::PaymentProof {
                addr,
                tx_id,
                amount_sats,
                payer_address,
            } => {
                info!(
                    %addr,
                    tx = %hex::encode(tx_id),
                    amount_sats,
                    payer = %payer_address,
                    "payment proof received"
                );
            }
            SessionEvent::PaymentRequest {
                addr,
                amount_sats,
                piece_index,
                expires_at,
                purpose,
                request_id,
                outbound,
            } => {
                self.dispatch_payment_request(
                    addr,
                    amount_sats,
                    piece_index,
                    expires_at,
                    purpose,
                    request_id,
                    outbound,
                );
            }
        }
    }

    /// Settles an inbound payment request off the event loop, answering
    /// with a proof or a typed rejection.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_payment_request(
        &self,
        addr: SocketAddr,
        amount_sats: u64,
        piece_index: u32,
        expires_at: u64,
        purpose: String,
        request_id: String,
        outbound: SessionSender,
    ) {
        let Some(payments) = self.payments.clone() else {
            tokio::spawn(reject(outbound, request_id, "payments not enabled".into()));
            return;
        };

        tokio::spawn(async move {
            // The request names no payee, so payment settles to the node's
            // own address.
            let request = PaymentRequest {
                request_id: request_id.clone(),
                from_peer: addr.to_string(),
                to_peer: payments.address().to_string(),
                amount_sats: amount_sats as i64,
                purpose,
                piece_index,
                expires_at: UNIX_EPOCH + Duration::from_secs(expires_at),
            };

            match payments.process_payment_request(&request).await {
                Ok(payment) => {
                    let mut tx_id = [0u8; 32];
                    if let Ok(raw) = hex::decode(&payment.tx_id) {
                        if raw.len() == 32 {
                            tx_id.copy_from_slice(&raw);
                        }
                    }
                    let proof = Message::PaymentProof {
                        tx_id,
                        amount_sats,
                        payer_address: payment.from_address.clone(),
                    };
                    if outbound.send(proof).await.is_err() {
                        debug!(%addr, "session gone before payment proof");
                    }
                }
                Err(err) => {
                    info!(%addr, request = %request.request_id, error = %err, "payment request rejected");
                    reject(outbound, request.request_id, err.to_string()).await;
                }
            }
        });
    }

    fn spawn_dht_tasks(&mut self) {
        let Some(dht) = self.dht.clone() else { return };

        self.tasks.push(tokio::spawn({
            let dht = Arc::clone(&dht);
            async move {
                if let Err(err) = dht.run().await {
                    warn!(error = %err, "dht server stopped");
                }
            }
        }));

        // Bootstrap, then keep the daemon announced and hunting for peers.
        let bootstrap_nodes = self.config.bootstrap_nodes.clone();
        let wire_port = self.config.port;
        self.tasks.push(tokio::spawn({
            let dht = Arc::clone(&dht);
            async move {
                if let Err(err) = dht.bootstrap(&bootstrap_nodes).await {
                    warn!(error = %err, "dht bootstrap failed");
                }

                let mut announce = tokio::time::interval(REANNOUNCE_INTERVAL);
                announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    announce.tick().await;
                    match dht.announce(InfoHash(NETWORK_INFO_HASH), wire_port).await {
                        Ok(count) => debug!(count, "daemon announced"),
                        Err(err) => warn!(error = %err, "announce failed"),
                    }
                }
            }
        }));

        let events = self.events_tx.clone();
        let peer_id = self.peer_id;
        let sessions = Arc::clone(&self.sessions);
        self.tasks.push(tokio::spawn({
            let dht = Arc::clone(&dht);
            async move {
                let mut discovery = tokio::time::interval(DISCOVERY_INTERVAL);
                discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                discovery.tick().await;
                loop {
                    discovery.tick().await;

                    match dht.find_peers(InfoHash(NETWORK_INFO_HASH)).await {
                        Ok(result) => {
                            debug!(peers = result.peers.len(), "dht discovery round");
                        }
                        Err(err) => {
                            warn!(error = %err, "dht discovery failed");
                            continue;
                        }
                    }

                    for record in dht.peer_store().peers_above(DIAL_QUALITY_FLOOR) {
                        if sessions.contains_key(&record.endpoint) {
                            continue;
                        }
                        dial(
                            record.endpoint,
                            peer_id,
                            events.clone(),
                            Arc::clone(&sessions),
                        );
                    }
                }
            }
        }));
    }

    fn spawn_tracker_tasks(&mut self) {
        let Some(registry) = self.tracker.clone() else { return };

        let http_port = self.config.tracker_http_port;
        self.tasks.push(tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                if let Err(err) = tracker::serve_http(registry, http_port).await {
                    warn!(error = %err, "tracker http stopped");
                }
            }
        }));

        let udp_port = self.config.tracker_udp_port;
        self.tasks.push(tokio::spawn({
            let server = Arc::new(UdpTrackerServer::new(Arc::clone(&registry)));
            async move {
                if let Err(err) = server.serve(udp_port).await {
                    warn!(error = %err, "tracker udp stopped");
                }
            }
        }));

        self.tasks.push(tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
                let mut stats = tokio::time::interval(TRACKER_STATS_INTERVAL);
                sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                sweep.tick().await;
                stats.tick().await;
                loop {
                    tokio::select! {
                        _ = sweep.tick() => {
                            registry.sweep();
                        }
                        _ = stats.tick() => {
                            let s = registry.stats();
                            info!(
                                swarms = s.total_swarms,
                                peers = s.total_peers,
                                seeders = s.total_seeders,
                                leechers = s.total_leechers,
                                completed = s.total_completed,
                                "tracker stats"
                            );
                        }
                    }
                }
            }
        }));
    }

    fn spawn_payment_tasks(&mut self) {
        let Some(payments) = self.payments.clone() else { return };
        info!(address = %payments.address(), "payments enabled");

        self.tasks.push(tokio::spawn({
            let payments = Arc::clone(&payments);
            async move { payments.run().await }
        }));

        self.tasks.push(tokio::spawn(async move {
            let mut stats = tokio::time::interval(PAYMENT_STATS_INTERVAL);
            stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            stats.tick().await;
            loop {
                stats.tick().await;
                let s = payments.stats();
                info!(
                    pending = s.pending_payments,
                    open_channels = s.channels.open,
                    total_channels = s.channels.total,
                    channel_value = s.channels.total_value,
                    "payment stats"
                );
            }
        }));
    }

    fn dial_configured_peers(&self) {
        for endpoint in &self.config.connect_peers {
            match endpoint.parse::<SocketAddr>() {
                Ok(addr) => dial(
                    addr,
                    self.peer_id,
                    self.events_tx.clone(),
                    Arc::clone(&self.sessions),
                ),
                Err(_) => warn!(endpoint, "unparseable peer endpoint in config"),
            }
        }
    }
}

/// Dials a peer with a few retries and registers the session on success.
fn dial(
    addr: SocketAddr,
    peer_id: PeerId,
    events: mpsc::Sender<SessionEvent>,
    sessions: Arc<DashMap<SocketAddr, SessionHandle>>,
) {
    tokio::spawn(async move {
        for attempt in 0..DIAL_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(DIAL_BACKOFF * attempt).await;
            }
            match session::connect(addr, InfoHash(WIRE_INFO_HASH), peer_id, events.clone()).await {
                Ok(handle) => {
                    info!(%addr, "outbound session established");
                    sessions.insert(addr, handle);
                    return;
                }
                Err(err) => {
                    debug!(%addr, attempt, error = %err, "dial failed");
                }
            }
        }
        warn!(%addr, "peer unreachable after {} attempts", DIAL_RETRIES);
    });
}

async fn reject(outbound: SessionSender, request_id: String, reason: String) {
    let _ = outbound
        .send(Message::PaymentReject { request_id, reason })
        .await;
}
