//! Distributed hash table for trackerless peer discovery.
//!
//! A Kademlia-style DHT speaking bencoded KRPC over UDP, protocol
//! compatible with the mainline network: `ping`, `find_node`, `get_peers`
//! and `announce_peer`. On top of the routing machinery sits a peer store
//! with a quality cache fed by wire-protocol metrics, which the supervisor
//! consults when deciding which discovered peers are worth dialing.
//!
//! Node ids and content identifiers share one 160-bit XOR keyspace. The
//! routing table keeps 160 buckets of up to eight nodes each; full buckets
//! probe their least-recently-seen occupant before giving its slot away.

mod error;
mod krpc;
mod node;
mod peers;
mod routing;
mod server;

pub use error::DhtError;
pub use krpc::{KrpcMessage, KrpcQuery, KrpcResponse, TransactionId};
pub use node::{NodeEntry, NodeId};
pub use peers::{Location, PeerRecord, PeerStore, QualityMetrics, DEFAULT_QUALITY};
pub use routing::{InsertOutcome, RoutingTable, K};
pub use server::{DhtServer, DhtStats, LookupResult, LookupState};

#[cfg(test)]
mod tests;
