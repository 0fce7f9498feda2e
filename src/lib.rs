//! nerdd - a peer-to-peer content distribution node
//!
//! A swarming peer that extends the classical wire protocol with
//! application extensions for quality metrics, geographic hints and
//! micropayment coordination.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding with the tracker's float extension
//! - [`wire`] - Handshake, framing, message codec, session state machine
//! - [`dht`] - Mainline-compatible DHT with a quality-scored peer store
//! - [`tracker`] - Swarm registry with HTTP and UDP announce surfaces
//! - [`payments`] - On-chain micropayments and payment channels
//! - [`config`] - JSON configuration with defaults
//! - [`node`] - Supervisor wiring the subsystems together

pub mod bencode;
pub mod config;
pub mod dht;
pub mod node;
pub mod payments;
pub mod tracker;
pub mod types;
pub mod wire;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{Config, ConfigError, PaymentConfig};
pub use dht::{DhtError, DhtServer, NodeEntry, NodeId, PeerStore, RoutingTable};
pub use node::{Node, NodeError};
pub use payments::{PaymentCoordinator, PaymentError, PrivateKey, Transaction};
pub use tracker::{SwarmRegistry, TrackerError, UdpTrackerServer};
pub use types::InfoHash;
pub use wire::{Handshake, Message, PeerId, SessionEvent, SessionHandle, WireError};
