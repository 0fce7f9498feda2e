//! Wire protocol engine.
//!
//! Framing, handshake, message codec and the per-connection session state
//! machine. Sessions multiplex classical swarm-control messages with the
//! application extensions (payments, quality metrics, geographic hints) and
//! surface inbound extension traffic to the supervisor over an event
//! channel.

mod error;
mod message;
mod peer_id;
pub mod session;
mod transport;

pub use error::WireError;
pub use message::{Handshake, Message, HANDSHAKE_LEN, RELIABILITY_SCALE};
pub use peer_id::PeerId;
pub use session::{SessionEvent, SessionHandle, SessionSender, SessionState};
pub use transport::{FrameReader, FrameWriter, WireTransport};

#[cfg(test)]
mod tests;
