//! Transaction signature hashing: the legacy scheme and BIP143 for witness
//! v0.

use crate::codec::{self, Encodable};
use crate::hash::{hash256, Hash256};
use crate::script::opcodes::OP_CODESEPARATOR;
use crate::script::{next_op, SigVersion};
use crate::tx::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Mask selecting the base hash type.
pub const SIGHASH_MASK: u32 = 0x1f;

/// The "one hash" returned by the legacy scheme for an out-of-range
/// SIGHASH_SINGLE.
fn one_hash() -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 1;
    Hash256(bytes)
}

/// Remove every OP_CODESEPARATOR from a script.
fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0;
    while pos < script.len() {
        match next_op(script, pos) {
            Ok((op, next)) => {
                if op.code != OP_CODESEPARATOR {
                    out.extend_from_slice(&script[pos..next]);
                }
                pos = next;
            }
            Err(_) => {
                out.extend_from_slice(&script[pos..]);
                break;
            }
        }
    }
    out
}

/// Compute the digest a signature over input `input_index` commits to.
///
/// `subscript` is the executed script from the last OP_CODESEPARATOR (the
/// caller performs signature deletion for the legacy scheme). `amount` is
/// the value of the spent output and only participates under BIP143.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    sighash_type: u32,
    version: SigVersion,
    amount: i64,
) -> Hash256 {
    match version {
        SigVersion::Base => legacy_hash(tx, input_index, subscript, sighash_type),
        SigVersion::WitnessV0 => bip143_hash(tx, input_index, subscript, sighash_type, amount),
    }
}

fn legacy_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    sighash_type: u32,
) -> Hash256 {
    let base_type = sighash_type & SIGHASH_MASK;
    let anyonecanpay = sighash_type & SIGHASH_ANYONECANPAY != 0;

    if input_index >= tx.inputs().len() {
        return one_hash();
    }
    // Historical quirk: SIGHASH_SINGLE with no matching output hashes the
    // number one instead of failing.
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs().len() {
        return one_hash();
    }

    let script_code = strip_code_separators(subscript);

    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version().to_le_bytes());

    // Inputs.
    if anyonecanpay {
        codec::write_varint(&mut buf, 1);
        tx.inputs()[input_index].outpoint.encode_to(&mut buf);
        codec::write_var_bytes(&mut buf, &script_code);
        buf.extend_from_slice(&tx.inputs()[input_index].sequence.to_le_bytes());
    } else {
        codec::write_varint(&mut buf, tx.inputs().len() as u64);
        for (i, input) in tx.inputs().iter().enumerate() {
            input.outpoint.encode_to(&mut buf);
            if i == input_index {
                codec::write_var_bytes(&mut buf, &script_code);
            } else {
                codec::write_varint(&mut buf, 0);
            }
            let sequence = if i != input_index
                && (base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE)
            {
                0
            } else {
                input.sequence
            };
            buf.extend_from_slice(&sequence.to_le_bytes());
        }
    }

    // Outputs.
    match base_type {
        SIGHASH_NONE => codec::write_varint(&mut buf, 0),
        SIGHASH_SINGLE => {
            codec::write_varint(&mut buf, input_index as u64 + 1);
            for _ in 0..input_index {
                // Null output: value -1, empty script.
                buf.extend_from_slice(&(-1i64).to_le_bytes());
                codec::write_varint(&mut buf, 0);
            }
            tx.outputs()[input_index].encode_to(&mut buf);
        }
        _ => {
            codec::write_varint(&mut buf, tx.outputs().len() as u64);
            for output in tx.outputs() {
                output.encode_to(&mut buf);
            }
        }
    }

    buf.extend_from_slice(&tx.lock_time().to_le_bytes());
    buf.extend_from_slice(&sighash_type.to_le_bytes());
    hash256(&buf)
}

fn bip143_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: u32,
    amount: i64,
) -> Hash256 {
    let base_type = sighash_type & SIGHASH_MASK;
    let anyonecanpay = sighash_type & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyonecanpay {
        Hash256::ZERO
    } else {
        let mut buf = Vec::new();
        for input in tx.inputs() {
            input.outpoint.encode_to(&mut buf);
        }
        hash256(&buf)
    };

    let hash_sequence = if anyonecanpay
        || base_type == SIGHASH_SINGLE
        || base_type == SIGHASH_NONE
    {
        Hash256::ZERO
    } else {
        let mut buf = Vec::new();
        for input in tx.inputs() {
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        hash256(&buf)
    };

    let hash_outputs = match base_type {
        SIGHASH_SINGLE if input_index < tx.outputs().len() => {
            hash256(&tx.outputs()[input_index].encode())
        }
        SIGHASH_NONE | SIGHASH_SINGLE => Hash256::ZERO,
        _ => {
            let mut buf = Vec::new();
            for output in tx.outputs() {
                output.encode_to(&mut buf);
            }
            hash256(&buf)
        }
    };

    let input = &tx.inputs()[input_index];
    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version().to_le_bytes());
    hash_prevouts.encode_to(&mut buf);
    hash_sequence.encode_to(&mut buf);
    input.outpoint.encode_to(&mut buf);
    codec::write_var_bytes(&mut buf, script_code);
    buf.extend_from_slice(&amount.to_le_bytes());
    buf.extend_from_slice(&input.sequence.to_le_bytes());
    hash_outputs.encode_to(&mut buf);
    buf.extend_from_slice(&tx.lock_time().to_le_bytes());
    buf.extend_from_slice(&sighash_type.to_le_bytes());
    hash256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::opcodes::{OP_CHECKSIG, OP_DUP};
    use crate::tx::{OutPoint, TxBuilder};

    fn two_in_two_out() -> Transaction {
        TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0xffff_ffff)
            .input(OutPoint { txid: Hash256([2; 32]), index: 1 }, vec![], 0xffff_fffe)
            .output(1000, vec![0x51])
            .output(2000, vec![0x52])
            .finalize()
    }

    #[test]
    fn deterministic() {
        let tx = two_in_two_out();
        let a = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        let b = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn input_index_changes_hash() {
        let tx = two_in_two_out();
        let a = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        let b = signature_hash(&tx, 1, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_type_changes_hash() {
        let tx = two_in_two_out();
        let all = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        let none = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_NONE, SigVersion::Base, 0);
        let single = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_SINGLE, SigVersion::Base, 0);
        assert_ne!(all, none);
        assert_ne!(all, single);
        assert_ne!(none, single);
    }

    #[test]
    fn single_out_of_range_is_one() {
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .input(OutPoint { txid: Hash256([2; 32]), index: 0 }, vec![], 0)
            .output(1000, vec![0x51])
            .finalize();
        let h = signature_hash(&tx, 1, &[OP_CHECKSIG], SIGHASH_SINGLE, SigVersion::Base, 0);
        assert_eq!(h, one_hash());
    }

    #[test]
    fn out_of_range_input_is_one() {
        let tx = two_in_two_out();
        let h = signature_hash(&tx, 5, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        assert_eq!(h, one_hash());
    }

    #[test]
    fn code_separators_stripped() {
        let tx = two_in_two_out();
        let with = signature_hash(
            &tx,
            0,
            &[OP_DUP, OP_CODESEPARATOR, OP_CHECKSIG],
            SIGHASH_ALL,
            SigVersion::Base,
            0,
        );
        let without = signature_hash(&tx, 0, &[OP_DUP, OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        assert_eq!(with, without);
    }

    #[test]
    fn anyonecanpay_ignores_other_inputs() {
        let tx_a = two_in_two_out();
        // Same second input outpoint changed: ANYONECANPAY|ALL over input 0
        // must not see it.
        let tx_b = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0xffff_ffff)
            .input(OutPoint { txid: Hash256([9; 32]), index: 9 }, vec![], 0)
            .output(1000, vec![0x51])
            .output(2000, vec![0x52])
            .finalize();
        let flags = SIGHASH_ALL | SIGHASH_ANYONECANPAY;
        let a = signature_hash(&tx_a, 0, &[OP_CHECKSIG], flags, SigVersion::Base, 0);
        let b = signature_hash(&tx_b, 0, &[OP_CHECKSIG], flags, SigVersion::Base, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn bip143_commits_to_amount() {
        let tx = two_in_two_out();
        let a = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::WitnessV0, 1000);
        let b = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::WitnessV0, 2000);
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_ignores_amount() {
        let tx = two_in_two_out();
        let a = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 1000);
        let b = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 2000);
        assert_eq!(a, b);
    }

    #[test]
    fn bip143_differs_from_legacy() {
        let tx = two_in_two_out();
        let legacy = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::Base, 0);
        let segwit = signature_hash(&tx, 0, &[OP_CHECKSIG], SIGHASH_ALL, SigVersion::WitnessV0, 0);
        assert_ne!(legacy, segwit);
    }

    #[test]
    fn bip143_single_out_of_range_uses_zero_outputs() {
        // Unlike legacy, BIP143 hashes a zero hashOutputs instead of the
        // one-hash quirk.
        let tx = TxBuilder::new()
            .input(OutPoint { txid: Hash256([1; 32]), index: 0 }, vec![], 0)
            .input(OutPoint { txid: Hash256([2; 32]), index: 0 }, vec![], 0)
            .output(1000, vec![0x51])
            .finalize();
        let h = signature_hash(&tx, 1, &[OP_CHECKSIG], SIGHASH_SINGLE, SigVersion::WitnessV0, 0);
        assert_ne!(h, one_hash());
    }
}
