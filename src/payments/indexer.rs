use super::error::PaymentError;
use super::keys::Network;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// An unspent output as the coordinator consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Utxo {
    pub tx_id: String,
    pub vout: u32,
    pub script_pubkey: String,
    pub satoshis: i64,
}

/// Shape of one element of the indexer's unspent-output listing.
#[derive(Debug, Deserialize)]
struct IndexerUtxo {
    #[allow(dead_code)]
    height: i64,
    tx_pos: u32,
    tx_hash: String,
    value: i64,
    script: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndexerTxStatus {
    #[serde(default)]
    blockheight: Option<i64>,
}

/// HTTP client for the configured blockchain indexer: UTXO listing, raw
/// transaction broadcast and confirmation lookups.
pub struct IndexerClient {
    http: reqwest::Client,
    network: Network,
    utxo_url_format: String,
    broadcast_url: String,
    status_url_format: Option<String>,
}

impl IndexerClient {
    pub fn new(
        network: Network,
        utxo_url_format: String,
        broadcast_url: String,
        status_url_format: Option<String>,
    ) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            network,
            utxo_url_format,
            broadcast_url,
            status_url_format,
        })
    }

    /// Fetches the full unspent set for `address`, in indexer order.
    pub async fn fetch_utxos(&self, address: &str) -> Result<Vec<Utxo>, PaymentError> {
        let url = expand_template(&self.utxo_url_format, self.network.as_url_segment(), address);
        debug!(%url, "fetching utxos");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PaymentError::IndexerDecode(format!(
                "utxo fetch returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let raw: Vec<IndexerUtxo> = serde_json::from_str(&body)
            .map_err(|e| PaymentError::IndexerDecode(format!("utxo listing: {}", e)))?;

        Ok(raw
            .into_iter()
            .map(|u| Utxo {
                tx_id: u.tx_hash,
                vout: u.tx_pos,
                script_pubkey: u.script.unwrap_or_default(),
                satoshis: u.value,
            })
            .collect())
    }

    /// Broadcasts a raw transaction. Success is a 200 whose body, trimmed,
    /// is a 64-character hex transaction id.
    pub async fn broadcast(&self, tx_hex: &str) -> Result<String, PaymentError> {
        debug!(url = %self.broadcast_url, len = tx_hex.len(), "broadcasting transaction");

        let response = self
            .http
            .post(&self.broadcast_url)
            .json(&serde_json::json!({ "txhex": tx_hex }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PaymentError::BroadcastFailed(format!(
                "{}: {}",
                status,
                body.trim()
            )));
        }

        let tx_id = body.trim().trim_matches('"').to_string();
        if tx_id.len() != 64 || !tx_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PaymentError::BroadcastFailed(format!(
                "response is not a transaction id: {}",
                tx_id
            )));
        }
        Ok(tx_id)
    }

    /// The block height a transaction confirmed at, `None` while it is
    /// still in the mempool or when no status endpoint is configured.
    pub async fn tx_block_height(&self, tx_id: &str) -> Result<Option<i64>, PaymentError> {
        let Some(format) = &self.status_url_format else {
            return Ok(None);
        };
        let url = expand_template(format, self.network.as_url_segment(), tx_id);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(%url, status = %response.status(), "tx status lookup failed");
            return Ok(None);
        }

        let status: IndexerTxStatus = response
            .json()
            .await
            .map_err(|e| PaymentError::IndexerDecode(format!("tx status: {}", e)))?;
        Ok(status.blockheight.filter(|h| *h >= 1))
    }
}

/// Substitutes the two `%s` placeholders of a configured URL template.
pub(crate) fn expand_template(template: &str, first: &str, second: &str) -> String {
    let once = template.replacen("%s", first, 1);
    once.replacen("%s", second, 1)
}
