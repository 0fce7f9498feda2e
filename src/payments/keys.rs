use super::error::PaymentError;
use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Which chain the node pays on; selects WIF and address version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Accepts the config spellings (`mainnet`/`main`, `testnet`/`test`).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "testnet" | "test" => Network::Testnet,
            _ => Network::Mainnet,
        }
    }

    fn wif_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x80,
            Network::Testnet => 0xEF,
        }
    }

    fn address_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet => 0x6F,
        }
    }

    /// Path segment the indexer URL templates expect.
    pub fn as_url_segment(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
        }
    }
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// RIPEMD-160 over SHA-256, the P2PKH public key hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}

fn base58check_encode(payload: &[u8]) -> String {
    let checksum = sha256d(payload);
    let mut data = payload.to_vec();
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

fn base58check_decode(s: &str) -> Result<Vec<u8>, PaymentError> {
    let data = bs58::decode(s)
        .into_vec()
        .map_err(|e| PaymentError::KeyParse(format!("base58: {}", e)))?;
    if data.len() < 5 {
        return Err(PaymentError::KeyParse("base58check payload too short".into()));
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if sha256d(payload)[..4] != *checksum {
        return Err(PaymentError::KeyParse("base58check checksum mismatch".into()));
    }
    Ok(payload.to_vec())
}

/// The node's payment identity: a secp256k1 key parsed from WIF at startup,
/// immutable afterwards.
pub struct PrivateKey {
    signing: SigningKey,
    compressed: bool,
}

impl PrivateKey {
    pub fn from_wif(wif: &str, network: Network) -> Result<Self, PaymentError> {
        let payload = base58check_decode(wif)?;

        if payload[0] != network.wif_version() {
            return Err(PaymentError::KeyParse(format!(
                "wif version byte {:#04x} does not match network",
                payload[0]
            )));
        }

        let (secret, compressed) = match payload.len() {
            33 => (&payload[1..33], false),
            34 if payload[33] == 0x01 => (&payload[1..33], true),
            _ => return Err(PaymentError::KeyParse("wif payload length invalid".into())),
        };

        let signing = SigningKey::from_slice(secret)
            .map_err(|e| PaymentError::KeyParse(format!("secp256k1: {}", e)))?;

        Ok(Self { signing, compressed })
    }

    /// SEC1 public key bytes, compressed iff the WIF said so.
    pub fn public_key(&self) -> Vec<u8> {
        self.signing
            .verifying_key()
            .to_encoded_point(self.compressed)
            .as_bytes()
            .to_vec()
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key())
    }

    /// The P2PKH address for this key on `network`, derived once.
    pub fn address(&self, network: Network) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(network.address_version());
        payload.extend_from_slice(&self.pubkey_hash());
        base58check_encode(&payload)
    }

    /// ECDSA over the single-SHA256 of `preimage` (the signer hashes once
    /// more, yielding the double-SHA digest transactions sign).
    pub fn sign_preimage(&self, preimage: &[u8]) -> Vec<u8> {
        let single: [u8; 32] = Sha256::digest(preimage).into();
        let signature: Signature = self.signing.sign(&single);
        let signature = signature.normalize_s().unwrap_or(signature);
        signature.to_der().as_bytes().to_vec()
    }

    #[cfg(test)]
    pub fn to_wif(&self, network: Network) -> String {
        let mut payload = vec![network.wif_version()];
        payload.extend_from_slice(&self.signing.to_bytes());
        if self.compressed {
            payload.push(0x01);
        }
        base58check_encode(&payload)
    }

    #[cfg(test)]
    pub fn from_secret(secret: &[u8; 32], compressed: bool) -> Self {
        Self {
            signing: SigningKey::from_slice(secret).expect("valid secret"),
            compressed,
        }
    }
}

/// Decodes a P2PKH address to its 20-byte public key hash. Both mainnet and
/// testnet version bytes are accepted; the address itself names the chain.
pub fn address_to_pubkey_hash(address: &str) -> Result<[u8; 20], PaymentError> {
    let payload = base58check_decode(address)
        .map_err(|_| PaymentError::AddressInvalid(address.to_string()))?;
    if payload.len() != 21 {
        return Err(PaymentError::AddressInvalid(address.to_string()));
    }
    if payload[0] != Network::Mainnet.address_version()
        && payload[0] != Network::Testnet.address_version()
    {
        return Err(PaymentError::AddressInvalid(address.to_string()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok(hash)
}
