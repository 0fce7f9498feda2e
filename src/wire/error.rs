use thiserror::Error;

/// Errors raised by the wire protocol engine.
#[derive(Debug, Error)]
pub enum WireError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote sent a malformed or mismatched handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame violated the length-prefixed framing rules.
    #[error("framing error: {0}")]
    Framing(String),

    /// A message id in the reserved range (<= 255) that we do not know.
    #[error("unknown message id {0}")]
    UnknownMessage(u32),

    /// The session's outbound queue is gone (session closing).
    #[error("session closed")]
    SessionClosed,

    /// Handshake or read deadline elapsed.
    #[error("timeout")]
    Timeout,
}
