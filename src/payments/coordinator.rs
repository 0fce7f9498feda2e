use super::channel::{ChannelLedger, ChannelStats, PaymentChannel, CHANNEL_IDLE_LIMIT};
use super::error::PaymentError;
use super::indexer::{IndexerClient, Utxo};
use super::keys::{Network, PrivateKey};
use super::tx::{
    fee_for, multisig_2of2_script, Transaction, DUST_THRESHOLD,
};
use crate::config::PaymentConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Fee assumed when deciding how many UTXOs to gather.
pub const INITIAL_FEE_ESTIMATE: i64 = 100;
/// Payment requests expire five minutes after creation.
pub const REQUEST_TTL: Duration = Duration::from_secs(5 * 60);
/// Prefix of the data output tagging a payment with its purpose.
pub const DATA_PREFIX: &[u8] = b"NERD_PAYMENT:";
const DATA_LIMIT: usize = 220;

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const CONFIRM_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Satoshis per NERD token.
const TOKEN_RATE_SATS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Broadcasted,
    Confirmed,
    Failed,
}

/// A broadcast payment awaiting confirmation. Confirmed payments stay
/// queryable.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub payment_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount_sats: i64,
    pub purpose: String,
    pub tx_id: String,
    pub created_at: Instant,
    pub confirmed_at: Option<Instant>,
    pub status: PaymentStatus,
}

/// An ephemeral request for payment, expiring five minutes after issue.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub request_id: String,
    pub from_peer: String,
    pub to_peer: String,
    pub amount_sats: i64,
    pub purpose: String,
    pub piece_index: u32,
    pub expires_at: SystemTime,
}

impl PaymentRequest {
    pub fn expires_at_unix(&self) -> u64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaymentStats {
    pub pending_payments: usize,
    pub channels: ChannelStats,
}

/// Selects the shortest prefix of `utxos` whose sum reaches `target`, or
/// the whole list when none does. Returns the prefix and its total.
pub fn select_utxos(utxos: &[Utxo], target: i64) -> (Vec<Utxo>, i64) {
    let mut selected = Vec::new();
    let mut total = 0i64;
    for utxo in utxos {
        selected.push(utxo.clone());
        total += utxo.satoshis;
        if total >= target {
            break;
        }
    }
    (selected, total)
}

/// Assembles the unsigned payment transaction: payment output, optional
/// purpose-tagging data output, fee-aware change handling.
pub fn build_payment(
    utxos: &[Utxo],
    to_address: &str,
    amount: i64,
    purpose: &str,
    fee_rate: f64,
    change_address: &str,
) -> Result<Transaction, PaymentError> {
    let mut tx = Transaction::new();
    for utxo in utxos {
        tx.add_input(&utxo.tx_id, utxo.vout, &utxo.script_pubkey, utxo.satoshis)?;
    }
    let total_in = tx.total_input();

    tx.add_p2pkh_output(to_address, amount)?;

    if !purpose.is_empty() {
        let mut data = DATA_PREFIX.to_vec();
        data.extend_from_slice(purpose.as_bytes());
        if data.len() > DATA_LIMIT {
            warn!(len = data.len(), "purpose data truncated");
            data.truncate(DATA_LIMIT);
        }
        tx.add_data_output(&data);
    }

    let mut fee = fee_for(tx.estimated_size(), fee_rate);
    let change = total_in - amount - fee;

    if change >= DUST_THRESHOLD {
        tx.add_p2pkh_output(change_address, change)?;

        // The change output grew the transaction; re-estimate and adjust.
        let final_fee = fee_for(tx.estimated_size(), fee_rate);
        if final_fee > fee {
            let adjusted = total_in - amount - final_fee;
            if adjusted < DUST_THRESHOLD {
                debug!(adjusted, "change below dust after re-estimate, fee absorbs it");
                tx.outputs.pop();
            } else if let Some(change_output) = tx.outputs.last_mut() {
                change_output.satoshis = adjusted;
            }
            fee = final_fee;
        }
    } else if change < 0 {
        return Err(PaymentError::InsufficientFunds {
            have: total_in,
            need: amount + fee,
        });
    } else {
        debug!(change, "change is dust, absorbed into fee");
    }

    debug!(
        inputs = total_in,
        amount,
        fee,
        outputs = tx.outputs.len(),
        "payment transaction assembled"
    );
    Ok(tx)
}

/// The payment coordinator: request intake, UTXO selection, transaction
/// assembly and broadcast, confirmation tracking and the channel ledger.
pub struct PaymentCoordinator {
    config: PaymentConfig,
    key: PrivateKey,
    network: Network,
    address: String,
    indexer: IndexerClient,
    pending: RwLock<HashMap<String, PendingPayment>>,
    channels: ChannelLedger,
}

impl PaymentCoordinator {
    pub fn new(config: PaymentConfig) -> Result<Self, PaymentError> {
        let network = Network::parse(&config.network_type);
        let key = PrivateKey::from_wif(&config.private_key_wif, network)?;
        let address = key.address(network);
        let indexer = IndexerClient::new(
            network,
            config.utxo_fetch_url_format.clone(),
            config.broadcast_url.clone(),
            config.tx_status_url_format.clone(),
        )?;

        info!(network = ?network, %address, "payment coordinator ready");

        Ok(Self {
            config,
            key,
            network,
            address,
            indexer,
            pending: RwLock::new(HashMap::new()),
            channels: ChannelLedger::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn channels(&self) -> &ChannelLedger {
        &self.channels
    }

    /// Issues a request for payment after checking the configured amount
    /// bounds.
    pub fn create_payment_request(
        &self,
        from_peer: &str,
        to_peer: &str,
        amount_sats: i64,
        purpose: &str,
        piece_index: u32,
    ) -> Result<PaymentRequest, PaymentError> {
        self.check_amount(amount_sats)?;

        let request = PaymentRequest {
            request_id: generate_payment_id(),
            from_peer: from_peer.to_string(),
            to_peer: to_peer.to_string(),
            amount_sats,
            purpose: purpose.to_string(),
            piece_index,
            expires_at: SystemTime::now() + REQUEST_TTL,
        };
        info!(
            request = %request.request_id,
            from = from_peer,
            to = to_peer,
            amount_sats,
            purpose,
            "payment request created"
        );
        Ok(request)
    }

    pub fn check_amount(&self, amount_sats: i64) -> Result<(), PaymentError> {
        let min = self.config.min_payment_satoshis;
        let max = self.config.max_payment_satoshis;
        if amount_sats < min || amount_sats > max {
            return Err(PaymentError::AmountOutOfRange {
                amount: amount_sats,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Accepts a payment request, pays it on-chain and records the pending
    /// payment. Rejections record no state.
    pub async fn process_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<PendingPayment, PaymentError> {
        self.check_amount(request.amount_sats)?;
        if SystemTime::now() >= request.expires_at {
            return Err(PaymentError::PaymentExpired);
        }

        let tx_id = self
            .send_payment(&request.to_peer, request.amount_sats, &request.purpose)
            .await?;

        let payment = PendingPayment {
            payment_id: generate_payment_id(),
            from_address: self.address.clone(),
            to_address: request.to_peer.clone(),
            amount_sats: request.amount_sats,
            purpose: request.purpose.clone(),
            tx_id,
            created_at: Instant::now(),
            confirmed_at: None,
            status: PaymentStatus::Broadcasted,
        };
        self.pending
            .write()
            .insert(payment.payment_id.clone(), payment.clone());

        info!(
            payment = %payment.payment_id,
            tx = %payment.tx_id,
            amount = payment.amount_sats,
            "payment broadcast"
        );
        Ok(payment)
    }

    /// NERD-token settlement: converts tokens to satoshis and pays.
    pub async fn process_token_payment(
        &self,
        from_peer: &str,
        to_peer: &str,
        tokens: u64,
        purpose: &str,
    ) -> Result<PendingPayment, PaymentError> {
        let amount = (tokens as i64) * TOKEN_RATE_SATS;
        let request = self.create_payment_request(
            from_peer,
            to_peer,
            amount,
            &format!("NERD_TOKEN:{}", purpose),
            0,
        )?;
        self.process_payment_request(&request).await
    }

    /// Fetches UTXOs, assembles, signs and broadcasts a payment. The
    /// returned id is the locally computed transaction hash.
    async fn send_payment(
        &self,
        to_address: &str,
        amount: i64,
        purpose: &str,
    ) -> Result<String, PaymentError> {
        let utxos = self.indexer.fetch_utxos(&self.address).await?;
        let (selected, total) = select_utxos(&utxos, amount + INITIAL_FEE_ESTIMATE);
        if total < amount {
            return Err(PaymentError::InsufficientFunds {
                have: total,
                need: amount,
            });
        }

        let mut tx = build_payment(
            &selected,
            to_address,
            amount,
            purpose,
            self.config.fee_rate,
            &self.address,
        )?;
        tx.sign(&self.key)?;

        self.broadcast_checked(&tx).await
    }

    /// Broadcasts a signed transaction and reconciles the returned id with
    /// the locally computed hash, preferring ours on mismatch.
    async fn broadcast_checked(&self, tx: &Transaction) -> Result<String, PaymentError> {
        let local_id = tx.txid_hex();
        let remote_id = self.indexer.broadcast(&hex::encode(tx.serialize())).await?;
        if remote_id != local_id {
            warn!(local = %local_id, remote = %remote_id, "broadcast id mismatch, keeping local");
        }
        Ok(local_id)
    }

    /// Opens a channel with a peer: real 2-of-2 funding, never a fabricated
    /// transaction id. Requires the counterparty public key; the channel
    /// only opens once the funding transaction confirms.
    pub async fn open_channel(
        &self,
        peer_address: &str,
        peer_pubkey: Option<Vec<u8>>,
        initial_a: i64,
        initial_b: i64,
    ) -> Result<PaymentChannel, PaymentError> {
        let Some(peer_pubkey) = peer_pubkey else {
            return Err(PaymentError::ChannelStateInvalid(
                "counterparty public key required to fund a channel".into(),
            ));
        };
        if initial_a < 0 || initial_b < 0 || initial_a + initial_b <= 0 {
            return Err(PaymentError::ChannelStateInvalid(
                "initial balances must be non-negative and fund something".into(),
            ));
        }

        let total = initial_a + initial_b;
        let funding_script = multisig_2of2_script(&self.key.public_key(), &peer_pubkey);

        let utxos = self.indexer.fetch_utxos(&self.address).await?;
        let (selected, have) = select_utxos(&utxos, total + INITIAL_FEE_ESTIMATE);
        if have < total {
            return Err(PaymentError::InsufficientFunds {
                have,
                need: total,
            });
        }

        let mut tx = build_funding(&selected, funding_script, total, self.config.fee_rate, &self.address)?;
        tx.sign(&self.key)?;
        let funding_tx_id = self.broadcast_checked(&tx).await?;

        let channel = PaymentChannel {
            channel_id: ChannelLedger::generate_channel_id(),
            party_a: self.address.clone(),
            party_b: peer_address.to_string(),
            party_b_pubkey: Some(peer_pubkey),
            initial_a,
            initial_b,
            current_a: initial_a,
            current_b: initial_b,
            seq_no: 0,
            timeout_block: self.config.channel_timeout_blocks,
            funding_tx_id: Some(funding_tx_id.clone()),
            is_open: false,
            last_update: Instant::now(),
        };
        self.channels.register(channel.clone());

        // The funding rides the confirmation poller like any payment.
        let tracking = PendingPayment {
            payment_id: generate_payment_id(),
            from_address: self.address.clone(),
            to_address: peer_address.to_string(),
            amount_sats: total,
            purpose: format!("channel_funding:{}", channel.channel_id),
            tx_id: funding_tx_id,
            created_at: Instant::now(),
            confirmed_at: None,
            status: PaymentStatus::Broadcasted,
        };
        self.pending
            .write()
            .insert(tracking.payment_id.clone(), tracking);

        info!(
            channel = %channel.channel_id,
            peer = peer_address,
            total,
            "channel funding broadcast"
        );
        Ok(channel)
    }

    pub fn update_channel(
        &self,
        channel_id: &str,
        new_a: i64,
        new_b: i64,
    ) -> Result<u32, PaymentError> {
        self.channels.update_balance(channel_id, new_a, new_b)
    }

    /// Closes a channel. When the funding details are known, the settlement
    /// transaction distributing the current balances is built and half
    /// signed; the counterparty's signature completes it out of band.
    pub fn close_channel(&self, channel_id: &str) -> Result<Option<String>, PaymentError> {
        let snapshot = self.channels.close(channel_id)?;

        let (Some(funding_tx_id), Some(peer_pubkey)) =
            (&snapshot.funding_tx_id, &snapshot.party_b_pubkey)
        else {
            info!(channel = channel_id, "channel closed without settlement");
            return Ok(None);
        };

        let funding_script = multisig_2of2_script(&self.key.public_key(), peer_pubkey);
        let total = snapshot.total();

        let mut tx = Transaction::new();
        tx.add_input(funding_tx_id, 0, &hex::encode(&funding_script), total)?;

        let fee = fee_for(256, self.config.fee_rate);
        let (a_out, b_out) = settle_amounts(snapshot.current_a, snapshot.current_b, fee);
        if a_out >= DUST_THRESHOLD {
            tx.add_p2pkh_output(&snapshot.party_a, a_out)?;
        }
        if b_out >= DUST_THRESHOLD {
            tx.add_p2pkh_output(&snapshot.party_b, b_out)?;
        }
        tx.sign_multisig_half(0, &self.key)?;

        info!(
            channel = channel_id,
            a = a_out,
            b = b_out,
            "channel closed, settlement half-signed"
        );
        Ok(Some(hex::encode(tx.serialize())))
    }

    pub fn payment(&self, payment_id: &str) -> Option<PendingPayment> {
        self.pending.read().get(payment_id).cloned()
    }

    pub fn stats(&self) -> PaymentStats {
        PaymentStats {
            pending_payments: self
                .pending
                .read()
                .values()
                .filter(|p| p.status == PaymentStatus::Broadcasted)
                .count(),
            channels: self.channels.stats(),
        }
    }

    /// Background loop: confirmation polling every 30 seconds, channel
    /// maintenance every 10 minutes.
    pub async fn run(self: Arc<Self>) {
        let mut confirm = tokio::time::interval(CONFIRM_POLL_INTERVAL);
        let mut channels = tokio::time::interval(CHANNEL_MAINTENANCE_INTERVAL);
        confirm.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        channels.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        confirm.tick().await;
        channels.tick().await;

        loop {
            tokio::select! {
                _ = confirm.tick() => self.check_confirmations().await,
                _ = channels.tick() => self.maintain_channels(),
            }
        }
    }

    async fn check_confirmations(&self) {
        let broadcasted: Vec<(String, String, Instant)> = self
            .pending
            .read()
            .values()
            .filter(|p| p.status == PaymentStatus::Broadcasted)
            .map(|p| (p.payment_id.clone(), p.tx_id.clone(), p.created_at))
            .collect();

        for (payment_id, tx_id, created_at) in broadcasted {
            match self.indexer.tx_block_height(&tx_id).await {
                Ok(Some(height)) => {
                    debug!(payment = %payment_id, tx = %tx_id, height, "payment confirmed");
                    let mut pending = self.pending.write();
                    if let Some(payment) = pending.get_mut(&payment_id) {
                        payment.status = PaymentStatus::Confirmed;
                        payment.confirmed_at = Some(Instant::now());
                    }
                    drop(pending);
                    self.channels.funding_confirmed(&tx_id);
                }
                Ok(None) => {
                    if created_at.elapsed() > CONFIRM_DEADLINE {
                        warn!(payment = %payment_id, tx = %tx_id, "payment unconfirmed past deadline");
                        if let Some(payment) = self.pending.write().get_mut(&payment_id) {
                            payment.status = PaymentStatus::Failed;
                        }
                    }
                }
                Err(err) => debug!(tx = %tx_id, error = %err, "confirmation lookup failed"),
            }
        }
    }

    fn maintain_channels(&self) {
        for channel_id in self.channels.idle_channels(CHANNEL_IDLE_LIMIT) {
            info!(channel = %channel_id, "auto-closing idle channel");
            if let Err(err) = self.close_channel(&channel_id) {
                warn!(channel = %channel_id, error = %err, "auto-close failed");
            }
        }
    }
}

/// Splits the settlement fee: party A (the closer) pays it as far as their
/// balance allows, the remainder comes off party B.
fn settle_amounts(current_a: i64, current_b: i64, fee: i64) -> (i64, i64) {
    if current_a >= fee {
        (current_a - fee, current_b)
    } else {
        (0, (current_b - (fee - current_a)).max(0))
    }
}

/// Funding-transaction assembly: one output locked by the channel's 2-of-2
/// script, change back to the funder.
fn build_funding(
    utxos: &[Utxo],
    funding_script: Vec<u8>,
    total: i64,
    fee_rate: f64,
    change_address: &str,
) -> Result<Transaction, PaymentError> {
    let mut tx = Transaction::new();
    for utxo in utxos {
        tx.add_input(&utxo.tx_id, utxo.vout, &utxo.script_pubkey, utxo.satoshis)?;
    }
    let total_in = tx.total_input();

    tx.add_output(funding_script, total);

    let mut fee = fee_for(tx.estimated_size(), fee_rate);
    let change = total_in - total - fee;
    if change >= DUST_THRESHOLD {
        tx.add_p2pkh_output(change_address, change)?;
        let final_fee = fee_for(tx.estimated_size(), fee_rate);
        if final_fee > fee {
            let adjusted = total_in - total - final_fee;
            if adjusted < DUST_THRESHOLD {
                tx.outputs.pop();
            } else if let Some(change_output) = tx.outputs.last_mut() {
                change_output.satoshis = adjusted;
            }
            fee = final_fee;
        }
    } else if change < 0 {
        return Err(PaymentError::InsufficientFunds {
            have: total_in,
            need: total + fee,
        });
    }

    Ok(tx)
}

fn generate_payment_id() -> String {
    let raw: [u8; 8] = rand::random();
    format!("pay_{}", hex::encode(raw))
}
