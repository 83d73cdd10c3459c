//! Transaction types: outpoints, inputs, outputs, witnesses, and coins.
//!
//! [`Transaction`] is immutable once constructed and lazily caches its txid
//! and wtxid. [`TxBuilder`] is the mutable form used while assembling and
//! signing; it finalizes into a [`Transaction`].

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::codec::{self, Decodable, Encodable, Reader};
use crate::constants::{MAX_BLOCK_WEIGHT, MAX_MONEY, WITNESS_SCALE_FACTOR};
use crate::error::{CodecError, TxError};
use crate::hash::{hash256, Hash256};

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint carried by coinbase inputs.
    pub fn null() -> Self {
        Self { txid: Hash256::ZERO, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl Encodable for OutPoint {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.txid.encode_to(buf);
        buf.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decodable for OutPoint {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self { txid: r.read_hash()?, index: r.read_u32()? })
    }
}

/// Witness stack for one input: a sequence of byte strings.
pub type Witness = Vec<Vec<u8>>;

/// A transaction input spending a previous output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The outpoint being spent. Null for coinbase.
    pub outpoint: OutPoint,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    /// Segwit witness stack. Empty for non-witness spends.
    pub witness: Witness,
    /// Sequence number (relative locktime under BIP68).
    pub sequence: u32,
}

impl TxInput {
    pub fn new(outpoint: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self { outpoint, script_sig, witness: Vec::new(), sequence }
    }
}

impl Encodable for TxInput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.outpoint.encode_to(buf);
        codec::write_var_bytes(buf, &self.script_sig);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decodable for TxInput {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let outpoint = OutPoint::decode_from(r)?;
        let script_sig = r.read_var_bytes()?;
        let sequence = r.read_u32()?;
        Ok(Self { outpoint, script_sig, witness: Vec::new(), sequence })
    }
}

/// A transaction output creating a spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: i64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOutput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        codec::write_var_bytes(buf, &self.script_pubkey);
    }
}

impl Decodable for TxOutput {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let value = r.read_i64()?;
        let script_pubkey = r.read_var_bytes()?;
        Ok(Self { value, script_pubkey })
    }
}

/// An unspent output record.
///
/// Created when an output is created, removed when spent, and carried in the
/// block's undo record so a disconnect can restore it.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Coin {
    /// The output itself.
    pub output: TxOutput,
    /// Height of the block that created this coin.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub coinbase: bool,
}

impl Coin {
    /// Whether this coin may be spent at `spend_height` given coinbase
    /// maturity.
    pub fn is_mature(&self, spend_height: u32) -> bool {
        if !self.coinbase {
            return true;
        }
        spend_height.saturating_sub(self.height) >= crate::constants::COINBASE_MATURITY
    }
}

/// An immutable transaction with cached identifiers.
///
/// The txid covers the base (witness-stripped) serialization; the wtxid
/// covers the full serialization. Fields are private so the caches can never
/// go stale; use [`TxBuilder`] to assemble a transaction.
#[derive(Debug)]
pub struct Transaction {
    version: i32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    lock_time: u32,
    txid: OnceLock<Hash256>,
    wtxid: OnceLock<Hash256>,
}

impl Clone for Transaction {
    fn clone(&self) -> Self {
        let cloned = Self {
            version: self.version,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            lock_time: self.lock_time,
            txid: OnceLock::new(),
            wtxid: OnceLock::new(),
        };
        if let Some(txid) = self.txid.get() {
            let _ = cloned.txid.set(*txid);
        }
        if let Some(wtxid) = self.wtxid.get() {
            let _ = cloned.wtxid.set(*wtxid);
        }
        cloned
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.lock_time == other.lock_time
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn new(version: i32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u32) -> Self {
        Self {
            version,
            inputs,
            outputs,
            lock_time,
            txid: OnceLock::new(),
            wtxid: OnceLock::new(),
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    /// Transaction ID: SHA-256d of the witness-stripped serialization.
    pub fn txid(&self) -> Hash256 {
        *self.txid.get_or_init(|| hash256(&self.encode_base()))
    }

    /// Witness transaction ID: SHA-256d of the full serialization.
    ///
    /// Equals the txid for transactions without witness data.
    pub fn wtxid(&self) -> Hash256 {
        *self.wtxid.get_or_init(|| hash256(&self.encode()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].outpoint.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Witness-stripped serialization, the txid preimage.
    pub fn encode_base(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_inner(&mut buf, false);
        buf
    }

    fn encode_inner(&self, buf: &mut Vec<u8>, allow_witness: bool) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        let witness = allow_witness && self.has_witness();
        if witness {
            buf.push(0x00); // marker
            buf.push(0x01); // flag
        }
        codec::write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_to(buf);
        }
        codec::write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_to(buf);
        }
        if witness {
            for input in &self.inputs {
                codec::write_varint(buf, input.witness.len() as u64);
                for item in &input.witness {
                    codec::write_var_bytes(buf, item);
                }
            }
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> usize {
        self.encode_base().len()
    }

    /// Full serialized size.
    pub fn total_size(&self) -> usize {
        self.encode().len()
    }

    /// BIP141 weight: `base_size * 3 + total_size`.
    pub fn weight(&self) -> usize {
        self.base_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    /// Virtual size: weight rounded up to the next whole scale unit.
    pub fn vsize(&self) -> usize {
        (self.weight() + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
    }

    /// Sum of all output values, `None` on overflow or out-of-range totals.
    pub fn output_value(&self) -> Option<i64> {
        let mut total: i64 = 0;
        for output in &self.outputs {
            if output.value < 0 || output.value > MAX_MONEY {
                return None;
            }
            total = total.checked_add(output.value)?;
            if total > MAX_MONEY {
                return None;
            }
        }
        Some(total)
    }

    /// Context-free sanity checks shared by mempool admission and block
    /// validation.
    pub fn check_sanity(&self) -> Result<(), TxError> {
        if self.inputs.is_empty() {
            return Err(TxError::EmptyInputs);
        }
        if self.outputs.is_empty() {
            return Err(TxError::EmptyOutputs);
        }
        let base = self.base_size();
        if base * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
            return Err(TxError::Oversized { size: base, max: MAX_BLOCK_WEIGHT / WITNESS_SCALE_FACTOR });
        }
        let mut total: i64 = 0;
        for (i, output) in self.outputs.iter().enumerate() {
            if output.value < 0 {
                return Err(TxError::NegativeOutput(i));
            }
            if output.value > MAX_MONEY {
                return Err(TxError::OutputTooLarge(i));
            }
            total = total.checked_add(output.value).ok_or(TxError::OutputOverflow)?;
            if total > MAX_MONEY {
                return Err(TxError::OutputOverflow);
            }
        }
        let mut seen = std::collections::HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input.outpoint) {
                return Err(TxError::DuplicateInput(input.outpoint.to_string()));
            }
        }
        if self.is_coinbase() {
            let len = self.inputs[0].script_sig.len();
            if !(2..=100).contains(&len) {
                return Err(TxError::BadCoinbaseLength(len));
            }
        } else {
            for (i, input) in self.inputs.iter().enumerate() {
                if input.outpoint.is_null() {
                    return Err(TxError::NullInput(i));
                }
            }
        }
        Ok(())
    }
}

impl Encodable for Transaction {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.encode_inner(buf, true);
    }
}

impl Decodable for Transaction {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let mut count = r.read_count(41)?;
        let mut segwit = false;
        if count == 0 {
            // Marker byte: the next byte must be the 0x01 flag.
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(CodecError::InvalidValue(format!("bad segwit flag {flag}")));
            }
            segwit = true;
            count = r.read_count(41)?;
        }
        let mut inputs = Vec::with_capacity(count);
        for _ in 0..count {
            inputs.push(TxInput::decode_from(r)?);
        }
        let out_count = r.read_count(9)?;
        let mut outputs = Vec::with_capacity(out_count);
        for _ in 0..out_count {
            outputs.push(TxOutput::decode_from(r)?);
        }
        if segwit {
            let mut any = false;
            for input in &mut inputs {
                let items = r.read_count(1)?;
                let mut witness = Vec::with_capacity(items);
                for _ in 0..items {
                    witness.push(r.read_var_bytes()?);
                }
                any |= !witness.is_empty();
                input.witness = witness;
            }
            if !any {
                // Marker present but every stack empty: malleated encoding.
                return Err(CodecError::InvalidValue("superfluous witness flag".into()));
            }
        }
        let lock_time = r.read_u32()?;
        Ok(Transaction::new(version, inputs, outputs, lock_time))
    }
}

/// Mutable transaction under construction. Finalizes into [`Transaction`].
#[derive(Clone, Debug, Default)]
pub struct TxBuilder {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self { version: 1, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn input(mut self, outpoint: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        self.inputs.push(TxInput::new(outpoint, script_sig, sequence));
        self
    }

    pub fn witness_input(
        mut self,
        outpoint: OutPoint,
        witness: Witness,
        sequence: u32,
    ) -> Self {
        let mut input = TxInput::new(outpoint, Vec::new(), sequence);
        input.witness = witness;
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, value: i64, script_pubkey: Vec<u8>) -> Self {
        self.outputs.push(TxOutput { value, script_pubkey });
        self
    }

    pub fn lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    /// Freeze into an immutable [`Transaction`].
    pub fn finalize(self) -> Transaction {
        Transaction::new(self.version, self.inputs, self.outputs, self.lock_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    fn sample_tx() -> Transaction {
        TxBuilder::new()
            .input(
                OutPoint { txid: Hash256([0x11; 32]), index: 0 },
                vec![0x51],
                0xffff_ffff,
            )
            .output(50 * COIN, vec![0x51])
            .finalize()
    }

    fn sample_witness_tx() -> Transaction {
        TxBuilder::new()
            .witness_input(
                OutPoint { txid: Hash256([0x22; 32]), index: 1 },
                vec![vec![0xaa; 71], vec![0xbb; 33]],
                0xffff_fffe,
            )
            .output(COIN, vec![0x00, 0x14].into_iter().chain([0u8; 20]).collect())
            .finalize()
    }

    fn sample_coinbase() -> Transaction {
        TxBuilder::new()
            .input(OutPoint::null(), vec![0x01, 0x02, 0x03], 0xffff_ffff)
            .output(50 * COIN, vec![0x51])
            .finalize()
    }

    // --- identity ---

    #[test]
    fn txid_deterministic_and_cached() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
        assert_eq!(tx.clone().txid(), tx.txid());
    }

    #[test]
    fn txid_equals_wtxid_without_witness() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn txid_differs_from_wtxid_with_witness() {
        let tx = sample_witness_tx();
        assert_ne!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn txid_ignores_witness() {
        let with = sample_witness_tx();
        let without = TxBuilder::new()
            .input(OutPoint { txid: Hash256([0x22; 32]), index: 1 }, vec![], 0xffff_fffe)
            .output(COIN, with.outputs()[0].script_pubkey.clone())
            .finalize();
        assert_eq!(with.txid(), without.txid());
    }

    // --- serialization ---

    #[test]
    fn round_trip_plain() {
        let tx = sample_tx();
        let decoded = Transaction::decode(&tx.encode()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn round_trip_witness() {
        let tx = sample_witness_tx();
        let encoded = tx.encode();
        // Marker and flag present.
        assert_eq!(encoded[4], 0x00);
        assert_eq!(encoded[5], 0x01);
        let decoded = Transaction::decode(&encoded).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.inputs()[0].witness.len(), 2);
        assert_eq!(decoded.wtxid(), tx.wtxid());
    }

    #[test]
    fn base_encoding_strips_witness() {
        let tx = sample_witness_tx();
        let base = tx.encode_base();
        assert_ne!(base[4], 0x00);
        let decoded = Transaction::decode(&base).unwrap();
        assert!(decoded.inputs()[0].witness.is_empty());
    }

    #[test]
    fn rejects_superfluous_witness_marker() {
        let tx = sample_tx();
        let mut buf = Vec::new();
        buf.extend_from_slice(&tx.version().to_le_bytes());
        buf.push(0x00);
        buf.push(0x01);
        codec::write_varint(&mut buf, 1);
        tx.inputs()[0].encode_to(&mut buf);
        codec::write_varint(&mut buf, 1);
        tx.outputs()[0].encode_to(&mut buf);
        codec::write_varint(&mut buf, 0); // empty witness stack
        buf.extend_from_slice(&tx.lock_time().to_le_bytes());
        assert!(Transaction::decode(&buf).is_err());
    }

    #[test]
    fn rejects_bad_flag() {
        let buf = [1, 0, 0, 0, 0x00, 0x02];
        assert!(Transaction::decode(&buf).is_err());
    }

    // --- sizes ---

    #[test]
    fn weight_and_vsize() {
        let tx = sample_tx();
        assert_eq!(tx.base_size(), tx.total_size());
        assert_eq!(tx.weight(), tx.base_size() * 4);
        assert_eq!(tx.vsize(), tx.base_size());

        let wtx = sample_witness_tx();
        assert!(wtx.total_size() > wtx.base_size());
        assert_eq!(wtx.weight(), wtx.base_size() * 3 + wtx.total_size());
        assert_eq!(wtx.vsize(), (wtx.weight() + 3) / 4);
    }

    // --- sanity ---

    #[test]
    fn sanity_accepts_valid() {
        assert!(sample_tx().check_sanity().is_ok());
        assert!(sample_coinbase().check_sanity().is_ok());
    }

    #[test]
    fn sanity_rejects_empty() {
        let no_inputs = Transaction::new(1, vec![], vec![TxOutput { value: 1, script_pubkey: vec![] }], 0);
        assert_eq!(no_inputs.check_sanity(), Err(TxError::EmptyInputs));
        let no_outputs = Transaction::new(
            1,
            vec![TxInput::new(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)],
            vec![],
            0,
        );
        assert_eq!(no_outputs.check_sanity(), Err(TxError::EmptyOutputs));
    }

    #[test]
    fn sanity_rejects_negative_value() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .output(-1, vec![])
            .finalize();
        assert_eq!(tx.check_sanity(), Err(TxError::NegativeOutput(0)));
    }

    #[test]
    fn sanity_rejects_value_above_max_money() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .output(MAX_MONEY + 1, vec![])
            .finalize();
        assert_eq!(tx.check_sanity(), Err(TxError::OutputTooLarge(0)));
    }

    #[test]
    fn sanity_rejects_total_overflow() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .output(MAX_MONEY, vec![])
            .output(MAX_MONEY, vec![])
            .finalize();
        assert_eq!(tx.check_sanity(), Err(TxError::OutputOverflow));
    }

    #[test]
    fn sanity_rejects_duplicate_inputs() {
        let op = OutPoint { txid: Hash256([1; 32]), index: 0 };
        let tx = TxBuilder::new()
            .input(op, vec![], 0)
            .input(op, vec![], 1)
            .output(1, vec![])
            .finalize();
        assert!(matches!(tx.check_sanity(), Err(TxError::DuplicateInput(_))));
    }

    #[test]
    fn sanity_rejects_bad_coinbase_script_length() {
        let short = TxBuilder::new()
            .input(OutPoint::null(), vec![0x01], 0)
            .output(1, vec![])
            .finalize();
        assert_eq!(short.check_sanity(), Err(TxError::BadCoinbaseLength(1)));
        let long = TxBuilder::new()
            .input(OutPoint::null(), vec![0; 101], 0)
            .output(1, vec![])
            .finalize();
        assert_eq!(long.check_sanity(), Err(TxError::BadCoinbaseLength(101)));
    }

    #[test]
    fn sanity_rejects_null_input_in_regular_tx() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .input(OutPoint::null(), vec![], 0)
            .output(1, vec![])
            .finalize();
        assert_eq!(tx.check_sanity(), Err(TxError::NullInput(1)));
    }

    // --- coins ---

    #[test]
    fn coin_maturity() {
        let coin = Coin {
            output: TxOutput { value: 50 * COIN, script_pubkey: vec![] },
            height: 100,
            coinbase: true,
        };
        assert!(!coin.is_mature(150));
        assert!(!coin.is_mature(199));
        assert!(coin.is_mature(200));
        let regular = Coin { coinbase: false, ..coin };
        assert!(regular.is_mature(100));
    }

    #[test]
    fn outpoint_null_round_trip() {
        let null = OutPoint::null();
        assert!(null.is_null());
        let decoded = OutPoint::decode(&null.encode()).unwrap();
        assert!(decoded.is_null());
    }

    #[test]
    fn output_value_totals() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .output(100, vec![])
            .output(250, vec![])
            .finalize();
        assert_eq!(tx.output_value(), Some(350));
    }
}
