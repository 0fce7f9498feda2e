//! Daemon configuration.
//!
//! A JSON document at a well-known path (`config.json` by default); a
//! missing file falls back to the documented defaults, a malformed one is a
//! fatal error.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config invalid: {0}")]
    Invalid(String),

    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// On-chain payment settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub private_key_wif: String,
    pub min_payment_satoshis: i64,
    pub max_payment_satoshis: i64,
    pub channel_timeout_blocks: i64,
    /// Satoshis per byte.
    pub fee_rate: f64,
    /// `mainnet` or `testnet`.
    pub network_type: String,
    pub broadcast_url: String,
    /// Two `%s` placeholders: network segment, then address.
    pub utxo_fetch_url_format: String,
    /// Two `%s` placeholders: network segment, then transaction id.
    pub tx_status_url_format: Option<String>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            private_key_wif: String::new(),
            min_payment_satoshis: 1,
            max_payment_satoshis: 10_000,
            channel_timeout_blocks: 144,
            fee_rate: 0.5,
            network_type: "testnet".to_string(),
            broadcast_url: "https://api.whatsonchain.com/v1/bsv/test/tx/raw".to_string(),
            utxo_fetch_url_format:
                "https://api.whatsonchain.com/v1/bsv/%s/address/%s/unspent".to_string(),
            tx_status_url_format: Some(
                "https://api.whatsonchain.com/v1/bsv/%s/tx/hash/%s".to_string(),
            ),
        }
    }
}

impl PaymentConfig {
    /// A key is usable when it is set and not one of the placeholder
    /// strings shipped in sample configs.
    pub fn has_usable_key(&self) -> bool {
        !self.private_key_wif.is_empty()
            && !self.private_key_wif.starts_with("REPLACE_WITH")
            && self.private_key_wif != "L1abc123def456..."
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub dht_port: u16,
    pub tracker_http_port: u16,
    pub tracker_udp_port: u16,
    pub enable_dht: bool,
    pub enable_tracker: bool,
    pub enable_bsv: bool,
    pub bootstrap_nodes: Vec<String>,
    pub connect_peers: Vec<String>,
    pub bsv_payment: PaymentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6881,
            dht_port: 6882,
            tracker_http_port: 8080,
            tracker_udp_port: 8081,
            enable_dht: true,
            enable_tracker: true,
            enable_bsv: true,
            bootstrap_nodes: vec![
                "router.utorrent.com:6881".to_string(),
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "dht.aelitis.com:6881".to_string(),
            ],
            connect_peers: Vec::new(),
            bsv_payment: PaymentConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config file, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        let config: Config =
            serde_json::from_str(&data).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let config = Config::load(Path::new("/definitely/not/here/config.json")).unwrap();
        assert_eq!(config.port, 6881);
        assert_eq!(config.dht_port, 6882);
        assert_eq!(config.tracker_http_port, 8080);
        assert_eq!(config.tracker_udp_port, 8081);
        assert!(config.enable_dht && config.enable_tracker && config.enable_bsv);
        assert_eq!(config.bootstrap_nodes.len(), 4);
        assert!(!config.bsv_payment.has_usable_key());
    }

    #[test]
    fn parses_full_document() {
        let json = r#"{
            "port": 7000,
            "dht_port": 7001,
            "tracker_http_port": 7080,
            "tracker_udp_port": 7081,
            "enable_dht": false,
            "enable_tracker": true,
            "enable_bsv": true,
            "bootstrap_nodes": ["router.example.com:6881"],
            "connect_peers": ["10.0.0.1:6881"],
            "bsv_payment": {
                "private_key_wif": "cVabc",
                "min_payment_satoshis": 5,
                "max_payment_satoshis": 50000,
                "channel_timeout_blocks": 288,
                "fee_rate": 0.05,
                "network_type": "testnet",
                "broadcast_url": "http://indexer.local/tx/raw",
                "utxo_fetch_url_format": "http://indexer.local/%s/address/%s/unspent"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 7000);
        assert!(!config.enable_dht);
        assert_eq!(config.connect_peers, vec!["10.0.0.1:6881".to_string()]);
        assert_eq!(config.bsv_payment.min_payment_satoshis, 5);
        assert_eq!(config.bsv_payment.channel_timeout_blocks, 288);
        assert!((config.bsv_payment.fee_rate - 0.05).abs() < 1e-12);
        assert!(config.bsv_payment.has_usable_key());
        // Fields the document omits keep their defaults.
        assert!(config.bsv_payment.tx_status_url_format.is_some());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{ "port": 9000 }"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.dht_port, 6882);
        assert!(config.enable_tracker);
    }

    #[test]
    fn placeholder_keys_are_unusable() {
        let mut payment = PaymentConfig::default();
        assert!(!payment.has_usable_key());
        payment.private_key_wif = "REPLACE_WITH_YOUR_PRIVATE_KEY".into();
        assert!(!payment.has_usable_key());
        payment.private_key_wif = "cTestKey".into();
        assert!(payment.has_usable_key());
    }
}
