//! Tracker service.
//!
//! A swarm registry fronted by two announce surfaces: an HTTP endpoint
//! (`/announce`, `/scrape`, `/stats`, `/health` plus the NERD extension
//! routes) and the BEP 15 UDP protocol. Peers rank by quality score when
//! the NERD extensions are enabled; otherwise selection is uniformly
//! random. A periodic sweep evicts idle peers and empty swarms.

mod error;
mod http;
mod swarm;
mod udp;

pub use error::TrackerError;
pub use http::serve as serve_http;
pub use swarm::{
    AnnounceEvent, AnnounceReply, AnnounceRequest, ScrapeCounts, SwarmRegistry, TrackerPeer,
    TrackerStats, ANNOUNCE_INTERVAL, DEFAULT_MAX_PEERS, DEFAULT_PEER_TIMEOUT,
    MIN_ANNOUNCE_INTERVAL,
};
pub use udp::UdpTrackerServer;

#[cfg(test)]
mod tests;
