use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed announce or scrape; reported to the client as a bencoded
    /// failure dictionary with HTTP 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(std::io::Error),

    #[error("unknown info hash")]
    UnknownInfoHash,
}
