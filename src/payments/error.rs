use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// The configured WIF key failed to parse. Fatal at startup.
    #[error("key parse error: {0}")]
    KeyParse(String),

    #[error("invalid address: {0}")]
    AddressInvalid(String),

    #[error("indexer http error: {0}")]
    IndexerHttp(#[from] reqwest::Error),

    #[error("indexer response invalid: {0}")]
    IndexerDecode(String),

    #[error("insufficient funds: have {have} satoshis, need {need}")]
    InsufficientFunds { have: i64, need: i64 },

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("channel state invalid: {0}")]
    ChannelStateInvalid(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("payment request expired")]
    PaymentExpired,

    #[error("amount {amount} outside allowed range [{min}, {max}]")]
    AmountOutOfRange { amount: i64, min: i64, max: i64 },
}
