//! Micropayment coordinator.
//!
//! Compensates upload contributions on-chain: WIF key and P2PKH address at
//! startup, UTXO selection against a blockchain indexer, fee-aware
//! transaction assembly with a purpose-tagging data output, deterministic
//! P2PKH signing, broadcast, and a confirmation poller. Payment channels
//! keep balances off-chain between a real 2-of-2 funding transaction and a
//! half-signed settlement.

mod channel;
mod coordinator;
mod error;
mod indexer;
mod keys;
mod tx;

pub use channel::{ChannelLedger, ChannelStats, PaymentChannel, CHANNEL_IDLE_LIMIT};
pub use coordinator::{
    build_payment, select_utxos, PaymentCoordinator, PaymentRequest, PaymentStats, PaymentStatus,
    PendingPayment, DATA_PREFIX, INITIAL_FEE_ESTIMATE, REQUEST_TTL,
};
pub use error::PaymentError;
pub use indexer::{IndexerClient, Utxo};
pub use keys::{address_to_pubkey_hash, hash160, sha256d, Network, PrivateKey};
pub use tx::{
    data_script, fee_for, multisig_2of2_script, p2pkh_script, Transaction, TxInput, TxOutput,
    DUST_THRESHOLD, SIGHASH_ALL_FORKID,
};
