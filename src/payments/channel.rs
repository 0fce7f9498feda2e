use super::error::PaymentError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Channels with no balance update for this long are closed by the
/// maintenance task.
pub const CHANNEL_IDLE_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Off-chain state of one bidirectional payment channel.
#[derive(Debug, Clone)]
pub struct PaymentChannel {
    pub channel_id: String,
    pub party_a: String,
    pub party_b: String,
    /// Counterparty public key, needed to reconstruct the funding script.
    pub party_b_pubkey: Option<Vec<u8>>,
    pub initial_a: i64,
    pub initial_b: i64,
    pub current_a: i64,
    pub current_b: i64,
    pub seq_no: u32,
    pub timeout_block: i64,
    pub funding_tx_id: Option<String>,
    pub is_open: bool,
    pub last_update: Instant,
}

impl PaymentChannel {
    pub fn total(&self) -> i64 {
        self.initial_a + self.initial_b
    }
}

/// Aggregates reported alongside payment statistics.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub open: usize,
    pub total: usize,
    pub total_value: i64,
}

/// The channel ledger. The map lock is never held while a channel's own
/// lock is taken.
pub struct ChannelLedger {
    channels: RwLock<HashMap<String, Arc<Mutex<PaymentChannel>>>>,
}

impl ChannelLedger {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn generate_channel_id() -> String {
        let raw: [u8; 8] = rand::random();
        format!("chan_{}", hex::encode(raw))
    }

    pub fn register(&self, channel: PaymentChannel) {
        let id = channel.channel_id.clone();
        self.channels
            .write()
            .insert(id, Arc::new(Mutex::new(channel)));
    }

    pub fn get(&self, channel_id: &str) -> Option<PaymentChannel> {
        let channel = self.channels.read().get(channel_id).cloned()?;
        let channel = channel.lock();
        Some(channel.clone())
    }

    fn shared(&self, channel_id: &str) -> Result<Arc<Mutex<PaymentChannel>>, PaymentError> {
        self.channels
            .read()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| PaymentError::ChannelNotFound(channel_id.to_string()))
    }

    /// Marks the channel open once its funding transaction confirmed.
    pub fn funding_confirmed(&self, funding_tx_id: &str) -> Option<String> {
        let channels: Vec<Arc<Mutex<PaymentChannel>>> =
            self.channels.read().values().cloned().collect();
        for shared in channels {
            let mut channel = shared.lock();
            if channel.funding_tx_id.as_deref() == Some(funding_tx_id) && !channel.is_open {
                channel.is_open = true;
                channel.last_update = Instant::now();
                info!(channel = %channel.channel_id, funding = funding_tx_id, "channel open");
                return Some(channel.channel_id.clone());
            }
        }
        None
    }

    /// Atomically replaces the balances. The new split must conserve the
    /// channel total and both sides must stay non-negative; `seq_no`
    /// strictly increases on success.
    pub fn update_balance(
        &self,
        channel_id: &str,
        new_a: i64,
        new_b: i64,
    ) -> Result<u32, PaymentError> {
        let shared = self.shared(channel_id)?;
        let mut channel = shared.lock();

        if !channel.is_open {
            return Err(PaymentError::ChannelStateInvalid(format!(
                "channel {} is not open",
                channel_id
            )));
        }
        if new_a < 0 || new_b < 0 {
            return Err(PaymentError::ChannelStateInvalid(
                "balances must be non-negative".into(),
            ));
        }
        if new_a + new_b != channel.total() {
            return Err(PaymentError::ChannelStateInvalid(format!(
                "total must remain {}, got {}",
                channel.total(),
                new_a + new_b
            )));
        }

        channel.current_a = new_a;
        channel.current_b = new_b;
        channel.seq_no += 1;
        channel.last_update = Instant::now();
        debug!(
            channel = channel_id,
            a = new_a,
            b = new_b,
            seq = channel.seq_no,
            "channel balances updated"
        );
        Ok(channel.seq_no)
    }

    /// Marks the channel closed and returns its final state for settlement.
    pub fn close(&self, channel_id: &str) -> Result<PaymentChannel, PaymentError> {
        let shared = self.shared(channel_id)?;
        let mut channel = shared.lock();
        if !channel.is_open && channel.funding_tx_id.is_none() {
            // Never funded; just drop the record.
            channel.last_update = Instant::now();
        } else if !channel.is_open {
            return Err(PaymentError::ChannelStateInvalid(format!(
                "channel {} is already closed",
                channel_id
            )));
        }
        channel.is_open = false;
        channel.last_update = Instant::now();
        Ok(channel.clone())
    }

    /// Ids of open channels idle past the limit.
    pub fn idle_channels(&self, limit: Duration) -> Vec<String> {
        let channels = self.channels.read();
        channels
            .values()
            .filter_map(|shared| {
                let channel = shared.lock();
                (channel.is_open && channel.last_update.elapsed() > limit)
                    .then(|| channel.channel_id.clone())
            })
            .collect()
    }

    pub fn stats(&self) -> ChannelStats {
        let channels: Vec<Arc<Mutex<PaymentChannel>>> =
            self.channels.read().values().cloned().collect();
        let mut stats = ChannelStats {
            open: 0,
            total: channels.len(),
            total_value: 0,
        };
        for shared in channels {
            let channel = shared.lock();
            if channel.is_open {
                stats.open += 1;
            }
            stats.total_value += channel.total();
        }
        stats
    }
}

impl Default for ChannelLedger {
    fn default() -> Self {
        Self::new()
    }
}
