use super::error::PaymentError;
use super::keys::{address_to_pubkey_hash, sha256d, PrivateKey};

/// Sighash flag covering all inputs and outputs with the fork id bit, as
/// the chain requires.
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

/// Outputs below this are not economically spendable.
pub const DUST_THRESHOLD: i64 = 1;

/// Size assumed for a P2PKH unlocking script before signing (DER signature
/// plus compressed public key with push opcodes).
pub const P2PKH_UNLOCK_ESTIMATE: usize = 108;

const TX_VERSION: u32 = 1;
const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone)]
pub struct TxInput {
    /// Funding transaction id in display (big-endian) byte order.
    pub prev_txid: [u8; 32],
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Locking script of the spent output, needed for the sighash.
    pub prev_script: Vec<u8>,
    pub prev_satoshis: i64,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub satoshis: i64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction under construction.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input spending `txid_hex:vout`, whose locking script and
    /// value are needed later for signing.
    pub fn add_input(
        &mut self,
        txid_hex: &str,
        vout: u32,
        script_pubkey_hex: &str,
        satoshis: i64,
    ) -> Result<(), PaymentError> {
        let raw = hex::decode(txid_hex)
            .map_err(|_| PaymentError::IndexerDecode(format!("bad txid hex: {}", txid_hex)))?;
        if raw.len() != 32 {
            return Err(PaymentError::IndexerDecode(format!(
                "txid not 32 bytes: {}",
                txid_hex
            )));
        }
        let mut prev_txid = [0u8; 32];
        prev_txid.copy_from_slice(&raw);

        let prev_script = hex::decode(script_pubkey_hex)
            .map_err(|_| PaymentError::IndexerDecode("bad script hex".into()))?;

        self.inputs.push(TxInput {
            prev_txid,
            prev_vout: vout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
            prev_script,
            prev_satoshis: satoshis,
        });
        Ok(())
    }

    pub fn add_p2pkh_output(&mut self, address: &str, satoshis: i64) -> Result<(), PaymentError> {
        let hash = address_to_pubkey_hash(address)?;
        self.outputs.push(TxOutput {
            satoshis,
            script_pubkey: p2pkh_script(&hash),
        });
        Ok(())
    }

    /// Appends a non-spendable data output.
    pub fn add_data_output(&mut self, data: &[u8]) {
        self.outputs.push(TxOutput {
            satoshis: 0,
            script_pubkey: data_script(data),
        });
    }

    pub fn add_output(&mut self, script_pubkey: Vec<u8>, satoshis: i64) {
        self.outputs.push(TxOutput {
            satoshis,
            script_pubkey,
        });
    }

    pub fn total_input(&self) -> i64 {
        self.inputs.iter().map(|i| i.prev_satoshis).sum()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.estimated_size());
        out.extend_from_slice(&TX_VERSION.to_le_bytes());

        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            let mut txid_le = input.prev_txid;
            txid_le.reverse();
            out.extend_from_slice(&txid_le);
            out.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&(output.satoshis as u64).to_le_bytes());
            write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    /// Transaction id in display byte order.
    pub fn txid(&self) -> [u8; 32] {
        let mut digest = sha256d(&self.serialize());
        digest.reverse();
        digest
    }

    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid())
    }

    /// Size estimate for fee computation: unsigned inputs count a nominal
    /// 108-byte unlocking script.
    pub fn estimated_size(&self) -> usize {
        let mut size = 4;

        size += varint_len(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 32 + 4;
            let script_len = if input.script_sig.is_empty() {
                P2PKH_UNLOCK_ESTIMATE
            } else {
                input.script_sig.len()
            };
            size += varint_len(script_len as u64) + script_len;
            size += 4;
        }

        size += varint_len(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8;
            size += varint_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
        }

        size + 4
    }

    /// BIP143-style sighash preimage for one input under
    /// `SIGHASH_ALL | FORKID`.
    fn sighash_preimage(&self, index: usize) -> Vec<u8> {
        let input = &self.inputs[index];

        let mut prevouts = Vec::with_capacity(self.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(self.inputs.len() * 4);
        for i in &self.inputs {
            let mut txid_le = i.prev_txid;
            txid_le.reverse();
            prevouts.extend_from_slice(&txid_le);
            prevouts.extend_from_slice(&i.prev_vout.to_le_bytes());
            sequences.extend_from_slice(&i.sequence.to_le_bytes());
        }

        let mut outputs = Vec::new();
        for o in &self.outputs {
            outputs.extend_from_slice(&(o.satoshis as u64).to_le_bytes());
            write_varint(&mut outputs, o.script_pubkey.len() as u64);
            outputs.extend_from_slice(&o.script_pubkey);
        }

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&TX_VERSION.to_le_bytes());
        preimage.extend_from_slice(&sha256d(&prevouts));
        preimage.extend_from_slice(&sha256d(&sequences));

        let mut txid_le = input.prev_txid;
        txid_le.reverse();
        preimage.extend_from_slice(&txid_le);
        preimage.extend_from_slice(&input.prev_vout.to_le_bytes());

        write_varint(&mut preimage, input.prev_script.len() as u64);
        preimage.extend_from_slice(&input.prev_script);
        preimage.extend_from_slice(&(input.prev_satoshis as u64).to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());

        preimage.extend_from_slice(&sha256d(&outputs));
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());
        preimage
    }

    /// Signs every input with a P2PKH unlocking script. Deterministic for
    /// fixed inputs (RFC 6979 nonces).
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), PaymentError> {
        let pubkey = key.public_key();
        for index in 0..self.inputs.len() {
            let preimage = self.sighash_preimage(index);
            let mut signature = key.sign_preimage(&preimage);
            signature.push(SIGHASH_ALL_FORKID as u8);

            let mut script_sig = Vec::with_capacity(signature.len() + pubkey.len() + 2);
            push_data(&mut script_sig, &signature);
            push_data(&mut script_sig, &pubkey);
            self.inputs[index].script_sig = script_sig;
        }
        Ok(())
    }

    /// Partially signs one input of a 2-of-2 multisig spend: `OP_0` plus our
    /// signature. The counterparty completes the witness.
    pub fn sign_multisig_half(
        &mut self,
        index: usize,
        key: &PrivateKey,
    ) -> Result<(), PaymentError> {
        if index >= self.inputs.len() {
            return Err(PaymentError::SignFailed(format!("no input {}", index)));
        }
        let preimage = self.sighash_preimage(index);
        let mut signature = key.sign_preimage(&preimage);
        signature.push(SIGHASH_ALL_FORKID as u8);

        let mut script_sig = vec![0x00]; // OP_0 for the CHECKMULTISIG bug
        push_data(&mut script_sig, &signature);
        self.inputs[index].script_sig = script_sig;
        Ok(())
    }
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(0x76); // OP_DUP
    script.push(0xA9); // OP_HASH160
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(0x88); // OP_EQUALVERIFY
    script.push(0xAC); // OP_CHECKSIG
    script
}

/// `OP_FALSE OP_RETURN <data>`.
pub fn data_script(data: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(data.len() + 4);
    script.push(0x00); // OP_FALSE
    script.push(0x6A); // OP_RETURN
    push_data(&mut script, data);
    script
}

/// `OP_2 <pk_a> <pk_b> OP_2 OP_CHECKMULTISIG`, the channel funding lock.
pub fn multisig_2of2_script(pubkey_a: &[u8], pubkey_b: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey_a.len() + pubkey_b.len() + 5);
    script.push(0x52); // OP_2
    push_data(&mut script, pubkey_a);
    push_data(&mut script, pubkey_b);
    script.push(0x52); // OP_2
    script.push(0xAE); // OP_CHECKMULTISIG
    script
}

fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=75 => out.push(data.len() as u8),
        76..=255 => {
            out.push(0x4C); // OP_PUSHDATA1
            out.push(data.len() as u8);
        }
        _ => {
            out.push(0x4D); // OP_PUSHDATA2
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
}

pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => out.push(n as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn varint_len(n: u64) -> usize {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// `max(1, ceil(size * rate))`.
pub fn fee_for(size: usize, fee_rate: f64) -> i64 {
    let fee = (size as f64 * fee_rate).ceil() as i64;
    fee.max(1)
}
