//! The script interpreter: a stack machine over byte strings.
//!
//! [`execute`] runs a single script against a stack; [`verify`] drives the
//! full input-spend evaluation including P2SH and witness v0 program
//! dispatch. The interpreter is stateless: identical inputs always produce
//! identical outcomes.

use sha2::{Digest, Sha256};

use crate::constants::{
    LOCKTIME_THRESHOLD, MAX_MULTISIG_PUBKEYS, MAX_SCRIPT_OPS, MAX_SCRIPT_PUSH, MAX_SCRIPT_SIZE,
    MAX_SCRIPT_STACK, SEQUENCE_DISABLE_FLAG, SEQUENCE_FINAL, SEQUENCE_MASK, SEQUENCE_TYPE_FLAG,
};
use crate::error::ScriptError;
use crate::hash::{hash160, hash256, sha256};
use crate::script::num::{self, DEFAULT_MAX_NUM_SIZE, LOCKTIME_MAX_NUM_SIZE};
use crate::script::opcodes::*;
use crate::script::sighash::{signature_hash, SIGHASH_ANYONECANPAY, SIGHASH_MASK, SIGHASH_SINGLE};
use crate::script::{
    find_and_delete, is_minimal_push, is_p2sh, is_push_only, next_op, witness_program,
    SigVersion, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_CLEANSTACK,
    VERIFY_DERSIG, VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
    VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM, VERIFY_LOW_S, VERIFY_MINIMALDATA,
    VERIFY_MINIMALIF, VERIFY_NULLDUMMY, VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_SIGPUSHONLY,
    VERIFY_STRICTENC, VERIFY_WITNESS, VERIFY_WITNESS_PUBKEYTYPE,
};
use crate::tx::{Transaction, Witness};

/// Verify that `script_sig` + `witness` satisfy `script_pubkey` for input
/// `input_index` of `tx` spending `amount`.
pub fn verify(
    script_sig: &[u8],
    witness: &Witness,
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: u32,
    amount: i64,
) -> Result<(), ScriptError> {
    if flags & VERIFY_SIGPUSHONLY != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    execute(script_sig, &mut stack, tx, input_index, flags, amount, SigVersion::Base)?;
    let stack_after_sig = stack.clone();
    execute(script_pubkey, &mut stack, tx, input_index, flags, amount, SigVersion::Base)?;

    if stack.last().map(|top| num::to_bool(top)) != Some(true) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;

    // Native witness program.
    if flags & VERIFY_WITNESS != 0 {
        if let Some((version, program)) = witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, tx, input_index, flags, amount)?;
            // The witness dictates the final stack; fake one element for the
            // cleanstack rule below.
            stack.truncate(1);
        }
    }

    // Pay-to-script-hash.
    if flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey) && !had_witness {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_after_sig;
        let redeem = stack.pop().ok_or(ScriptError::EvalFalse)?;
        execute(&redeem, &mut stack, tx, input_index, flags, amount, SigVersion::Base)?;
        if stack.last().map(|top| num::to_bool(top)) != Some(true) {
            return Err(ScriptError::EvalFalse);
        }

        if flags & VERIFY_WITNESS != 0 {
            if let Some((version, program)) = witness_program(&redeem) {
                had_witness = true;
                // scriptSig must be exactly the single push of the redeem
                // script; anything else is malleation.
                let mut expected = Vec::new();
                crate::script::push_data(&mut expected, &redeem);
                if script_sig != expected {
                    return Err(ScriptError::WitnessMalleated);
                }
                verify_witness_program(witness, version, program, tx, input_index, flags, amount)?;
                stack.truncate(1);
            }
        }
    }

    if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    // A witness attached to a non-witness spend is malleation.
    if flags & VERIFY_WITNESS != 0 && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }

    Ok(())
}

/// Evaluate a witness program spend.
fn verify_witness_program(
    witness: &Witness,
    version: u8,
    program: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: u32,
    amount: i64,
) -> Result<(), ScriptError> {
    if version != 0 {
        if flags & VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM != 0 {
            return Err(ScriptError::DiscourageUpgradableWitnessProgram);
        }
        // Unknown versions are anyone-can-spend for now.
        return Ok(());
    }

    let (mut stack, script): (Vec<Vec<u8>>, Vec<u8>) = match program.len() {
        20 => {
            // P2WPKH: implicit P2PKH over the 20-byte key hash.
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut script = vec![OP_DUP, OP_HASH160, 0x14];
            script.extend_from_slice(program);
            script.push(OP_EQUALVERIFY);
            script.push(OP_CHECKSIG);
            (witness.clone(), script)
        }
        32 => {
            // P2WSH: last element is the witness script.
            if witness.is_empty() {
                return Err(ScriptError::WitnessProgramEmpty);
            }
            let script = witness[witness.len() - 1].clone();
            if sha256(&script) != *program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (witness[..witness.len() - 1].to_vec(), script)
        }
        _ => return Err(ScriptError::WitnessProgramWrongLength),
    };

    for item in &stack {
        if item.len() > MAX_SCRIPT_PUSH {
            return Err(ScriptError::PushSize);
        }
    }

    execute(&script, &mut stack, tx, input_index, flags, amount, SigVersion::WitnessV0)?;

    // Witness evaluation always applies the clean-stack rule.
    if stack.len() != 1 || !num::to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

/// Execute one script against `stack`.
pub fn execute(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    tx: &Transaction,
    input_index: usize,
    flags: u32,
    amount: i64,
    version: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let minimal = flags & VERIFY_MINIMALDATA != 0;
    let mut alt: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut last_separator = 0usize;
    let mut pos = 0usize;

    while pos < script.len() {
        let (op, next) = next_op(script, pos)?;
        pos = next;
        let executing = exec_stack.iter().all(|b| *b);

        if op.code <= OP_PUSHDATA4 && op.push.len() > MAX_SCRIPT_PUSH {
            return Err(ScriptError::PushSize);
        }
        if op.code > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(op.code) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && op.code <= OP_PUSHDATA4 {
            if minimal && !is_minimal_push(op.code, op.push) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(op.push.to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&op.code) {
            match op.code {
                // --- constants ---
                OP_1NEGATE => stack.push(vec![0x81]),
                code if small_int(code).is_some() => {
                    stack.push(vec![small_int(code).expect("checked")]);
                }

                // --- flow control ---
                OP_NOP => {}
                OP_VER => return Err(ScriptError::BadOpcode),
                OP_VERIF | OP_VERNOTIF => return Err(ScriptError::BadOpcode),
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        if flags & VERIFY_MINIMALIF != 0 && version == SigVersion::WitnessV0 {
                            if top.len() > 1 || (top.len() == 1 && top[0] != 1) {
                                return Err(ScriptError::MinimalIf);
                            }
                        }
                        value = num::to_bool(&top);
                        if op.code == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let top = exec_stack.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *top = !*top;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    if !num::to_bool(&top) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                // --- stack ---
                OP_TOALTSTACK => {
                    alt.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
                }
                OP_FROMALTSTACK => {
                    stack.push(alt.pop().ok_or(ScriptError::InvalidStackOperation)?);
                }
                OP_2DROP => {
                    pop_n(stack, 2)?;
                }
                OP_2DUP => {
                    let len = require(stack, 2)?;
                    let a = stack[len - 2].clone();
                    let b = stack[len - 1].clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let len = require(stack, 3)?;
                    for i in 0..3 {
                        stack.push(stack[len - 3 + i].clone());
                    }
                }
                OP_2OVER => {
                    let len = require(stack, 4)?;
                    stack.push(stack[len - 4].clone());
                    stack.push(stack[len - 3].clone());
                }
                OP_2ROT => {
                    let len = require(stack, 6)?;
                    let a = stack.remove(len - 6);
                    let b = stack.remove(len - 6);
                    stack.push(a);
                    stack.push(b);
                }
                OP_2SWAP => {
                    let len = require(stack, 4)?;
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
                    if num::to_bool(top) {
                        stack.push(top.clone());
                    }
                }
                OP_DEPTH => {
                    stack.push(num::encode(stack.len() as i64));
                }
                OP_DROP => {
                    stack.pop().ok_or(ScriptError::StackUnderflow)?;
                }
                OP_DUP => {
                    let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                    stack.push(top);
                }
                OP_NIP => {
                    let len = require(stack, 2)?;
                    stack.remove(len - 2);
                }
                OP_OVER => {
                    let len = require(stack, 2)?;
                    stack.push(stack[len - 2].clone());
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num(stack, minimal)?;
                    let len = stack.len();
                    if n < 0 || n as usize >= len {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let idx = len - 1 - n as usize;
                    if op.code == OP_PICK {
                        stack.push(stack[idx].clone());
                    } else {
                        let item = stack.remove(idx);
                        stack.push(item);
                    }
                }
                OP_ROT => {
                    let len = require(stack, 3)?;
                    let item = stack.remove(len - 3);
                    stack.push(item);
                }
                OP_SWAP => {
                    let len = require(stack, 2)?;
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    let len = require(stack, 2)?;
                    let top = stack[len - 1].clone();
                    stack.insert(len - 2, top);
                }
                OP_SIZE => {
                    let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
                    let size = top.len() as i64;
                    stack.push(num::encode(size));
                }

                // --- comparison ---
                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let a = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let equal = a == b;
                    if op.code == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_item(equal));
                    }
                }
                OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 => {
                    return Err(ScriptError::BadOpcode);
                }

                // --- arithmetic ---
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num(stack, minimal)?;
                    let result = match op.code {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(num::encode(result));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let b = pop_num(stack, minimal)?;
                    let a = pop_num(stack, minimal)?;
                    let result = match op.code {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if op.code == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(num::encode(result));
                    }
                }
                OP_WITHIN => {
                    let max = pop_num(stack, minimal)?;
                    let min = pop_num(stack, minimal)?;
                    let x = pop_num(stack, minimal)?;
                    stack.push(bool_item(min <= x && x < max));
                }

                // --- crypto ---
                OP_RIPEMD160 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    use ripemd::Digest as _;
                    stack.push(ripemd::Ripemd160::digest(&top).to_vec());
                }
                OP_SHA1 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    use sha1::Digest as _;
                    stack.push(sha1::Sha1::digest(&top).to_vec());
                }
                OP_SHA256 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(Sha256::digest(&top).to_vec());
                }
                OP_HASH160 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(hash160(&top).to_vec());
                }
                OP_HASH256 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(hash256(&top).0.to_vec());
                }
                OP_CODESEPARATOR => {
                    last_separator = pos;
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;

                    let mut subscript = script[last_separator..].to_vec();
                    if version == SigVersion::Base {
                        subscript = find_and_delete(&subscript, &sig);
                    }

                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags, version)?;
                    let valid = check_sig(
                        &sig, &pubkey, &subscript, tx, input_index, flags, amount, version,
                    );

                    if !valid && flags & VERIFY_NULLFAIL != 0 && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }
                    if op.code == OP_CHECKSIGVERIFY {
                        if !valid {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_item(valid));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let key_count = pop_num(stack, minimal)?;
                    if key_count < 0 || key_count as usize > MAX_MULTISIG_PUBKEYS {
                        return Err(ScriptError::PubKeyCount);
                    }
                    op_count += key_count as usize;
                    if op_count > MAX_SCRIPT_OPS {
                        return Err(ScriptError::OpCount);
                    }
                    let mut pubkeys = Vec::with_capacity(key_count as usize);
                    for _ in 0..key_count {
                        pubkeys.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
                    }
                    let sig_count = pop_num(stack, minimal)?;
                    if sig_count < 0 || sig_count > key_count {
                        return Err(ScriptError::SigCount);
                    }
                    let mut sigs = Vec::with_capacity(sig_count as usize);
                    for _ in 0..sig_count {
                        sigs.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
                    }
                    // The off-by-one dummy element.
                    let dummy = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                        return Err(ScriptError::SigNullDummy);
                    }

                    let mut subscript = script[last_separator..].to_vec();
                    if version == SigVersion::Base {
                        for sig in &sigs {
                            subscript = find_and_delete(&subscript, sig);
                        }
                    }

                    let mut valid = true;
                    let mut sig_idx = 0usize;
                    let mut key_idx = 0usize;
                    while sig_idx < sigs.len() {
                        if key_idx >= pubkeys.len()
                            || sigs.len() - sig_idx > pubkeys.len() - key_idx
                        {
                            valid = false;
                            break;
                        }
                        let sig = &sigs[sig_idx];
                        let pubkey = &pubkeys[key_idx];
                        check_signature_encoding(sig, flags)?;
                        check_pubkey_encoding(pubkey, flags, version)?;
                        if check_sig(
                            sig, pubkey, &subscript, tx, input_index, flags, amount, version,
                        ) {
                            sig_idx += 1;
                        }
                        key_idx += 1;
                    }

                    if !valid && flags & VERIFY_NULLFAIL != 0 {
                        if sigs.iter().any(|sig| !sig.is_empty()) {
                            return Err(ScriptError::SigNullFail);
                        }
                    }
                    if op.code == OP_CHECKMULTISIGVERIFY {
                        if !valid {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(bool_item(valid));
                    }
                }

                // --- locktime ---
                OP_CHECKLOCKTIMEVERIFY => {
                    if flags & VERIFY_CHECKLOCKTIMEVERIFY == 0 {
                        if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                        let locktime = num::decode(top, minimal, LOCKTIME_MAX_NUM_SIZE)?;
                        if locktime < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        check_locktime(locktime, tx, input_index)?;
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if flags & VERIFY_CHECKSEQUENCEVERIFY == 0 {
                        if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                        let sequence = num::decode(top, minimal, LOCKTIME_MAX_NUM_SIZE)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if sequence as u32 & SEQUENCE_DISABLE_FLAG == 0 {
                            check_sequence(sequence, tx, input_index)?;
                        }
                    }
                }
                OP_NOP1 | OP_NOP4 | OP_NOP5 | OP_NOP6 | OP_NOP7 | OP_NOP8 | OP_NOP9
                | OP_NOP10 => {
                    if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }

                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt.len() > MAX_SCRIPT_STACK {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn bool_item(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn require(stack: &[Vec<u8>], n: usize) -> Result<usize, ScriptError> {
    if stack.len() < n {
        return Err(ScriptError::StackUnderflow);
    }
    Ok(stack.len())
}

fn pop_n(stack: &mut Vec<Vec<u8>>, n: usize) -> Result<(), ScriptError> {
    for _ in 0..n {
        stack.pop().ok_or(ScriptError::StackUnderflow)?;
    }
    Ok(())
}

fn pop_num(stack: &mut Vec<Vec<u8>>, minimal: bool) -> Result<i64, ScriptError> {
    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
    num::decode(&top, minimal, DEFAULT_MAX_NUM_SIZE)
}

/// BIP65: compare the stack operand against the transaction locktime.
fn check_locktime(locktime: i64, tx: &Transaction, input_index: usize) -> Result<(), ScriptError> {
    let tx_locktime = tx.lock_time() as i64;
    let same_kind = (locktime < LOCKTIME_THRESHOLD as i64)
        == (tx_locktime < LOCKTIME_THRESHOLD as i64);
    if !same_kind {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    if locktime > tx_locktime {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    // A final input never reaches the locktime, so the promise is vacuous.
    if tx.inputs()[input_index].sequence == SEQUENCE_FINAL {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    Ok(())
}

/// BIP112: compare the stack operand against the input sequence.
fn check_sequence(sequence: i64, tx: &Transaction, input_index: usize) -> Result<(), ScriptError> {
    let input_sequence = tx.inputs()[input_index].sequence as i64;
    if tx.version() < 2 {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    if input_sequence & SEQUENCE_DISABLE_FLAG as i64 != 0 {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    let mask = (SEQUENCE_TYPE_FLAG | SEQUENCE_MASK) as i64;
    let masked_op = sequence & mask;
    let masked_input = input_sequence & mask;
    let same_kind = (masked_op & SEQUENCE_TYPE_FLAG as i64)
        == (masked_input & SEQUENCE_TYPE_FLAG as i64);
    if !same_kind {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    if masked_op & SEQUENCE_MASK as i64 > masked_input & SEQUENCE_MASK as i64 {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    Ok(())
}

/// DER structural validation of a signature (excluding the hashtype byte).
fn is_valid_der(sig: &[u8]) -> bool {
    // sig includes the trailing hashtype byte.
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 {
        return false;
    }
    if sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 {
        return false;
    }
    if sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 {
        return false;
    }
    if sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

/// Whether the signature's S value is in the lower half of the curve order.
fn is_low_s(sig: &[u8]) -> bool {
    if sig.is_empty() {
        return true;
    }
    let der = &sig[..sig.len() - 1];
    match secp256k1::ecdsa::Signature::from_der_lax(der) {
        Ok(parsed) => {
            let mut normalized = parsed;
            // If normalization changes the signature, S was high.
            normalized.normalize_s();
            normalized.serialize_der().as_ref() == parsed.serialize_der().as_ref()
        }
        Err(_) => false,
    }
}

fn check_signature_encoding(sig: &[u8], flags: u32) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    if flags & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0 && !is_valid_der(sig) {
        return Err(ScriptError::SigDer);
    }
    if flags & VERIFY_LOW_S != 0 && !is_low_s(sig) {
        return Err(ScriptError::SigHighS);
    }
    if flags & VERIFY_STRICTENC != 0 {
        let hash_type = sig[sig.len() - 1] as u32;
        let base = hash_type & !SIGHASH_ANYONECANPAY;
        if !(crate::script::sighash::SIGHASH_ALL..=SIGHASH_SINGLE).contains(&(base & SIGHASH_MASK))
            || base & SIGHASH_MASK != base
        {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(
    pubkey: &[u8],
    flags: u32,
    version: SigVersion,
) -> Result<(), ScriptError> {
    if flags & VERIFY_STRICTENC != 0 && !is_canonical_pubkey(pubkey) {
        return Err(ScriptError::PubKeyEncoding);
    }
    if flags & VERIFY_WITNESS_PUBKEYTYPE != 0
        && version == SigVersion::WitnessV0
        && !is_compressed_pubkey(pubkey)
    {
        return Err(ScriptError::WitnessPubKeyType);
    }
    Ok(())
}

fn is_canonical_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        Some(0x04) => pubkey.len() == 65,
        _ => false,
    }
}

fn is_compressed_pubkey(pubkey: &[u8]) -> bool {
    pubkey.len() == 33 && matches!(pubkey[0], 0x02 | 0x03)
}

/// Run the actual ECDSA verification over the committed digest.
#[allow(clippy::too_many_arguments)]
fn check_sig(
    sig: &[u8],
    pubkey: &[u8],
    subscript: &[u8],
    tx: &Transaction,
    input_index: usize,
    _flags: u32,
    amount: i64,
    version: SigVersion,
) -> bool {
    if sig.is_empty() {
        return false;
    }
    let hash_type = sig[sig.len() - 1] as u32;
    let der = &sig[..sig.len() - 1];

    let Ok(mut signature) = secp256k1::ecdsa::Signature::from_der_lax(der) else {
        return false;
    };
    signature.normalize_s();
    let Ok(key) = secp256k1::PublicKey::from_slice(pubkey) else {
        return false;
    };

    let digest = signature_hash(tx, input_index, subscript, hash_type, version, amount);
    let Ok(message) = secp256k1::Message::from_digest_slice(digest.as_bytes()) else {
        return false;
    };

    secp256k1::SECP256K1.verify_ecdsa(&message, &signature, &key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::push_data;
    use crate::script::VERIFY_NONE;
    use crate::tx::{OutPoint, TxBuilder};

    fn dummy_tx() -> Transaction {
        TxBuilder::new()
            .input(
                OutPoint { txid: crate::hash::Hash256([1; 32]), index: 0 },
                vec![],
                0xffff_fffe,
            )
            .output(1000, vec![])
            .finalize()
    }

    fn run(script: &[u8], stack: &mut Vec<Vec<u8>>) -> Result<(), ScriptError> {
        let tx = dummy_tx();
        execute(script, stack, &tx, 0, VERIFY_NONE, 0, SigVersion::Base)
    }

    fn run_flags(script: &[u8], stack: &mut Vec<Vec<u8>>, flags: u32) -> Result<(), ScriptError> {
        let tx = dummy_tx();
        execute(script, stack, &tx, 0, flags, 0, SigVersion::Base)
    }

    // --- basic execution ---

    #[test]
    fn push_and_add() {
        let mut stack = Vec::new();
        run(&[OP_2, OP_3, OP_ADD], &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(5)]);
    }

    #[test]
    fn if_else_branches() {
        // Stack [1,2], script: OP_2 OP_EQUAL OP_IF OP_3 OP_ELSE OP_4 OP_ENDIF OP_5.
        let mut stack = vec![num::encode(1), num::encode(2)];
        let script = [OP_2, OP_EQUAL, OP_IF, OP_3, OP_ELSE, OP_4, OP_ENDIF, OP_5];
        run(&script, &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(1), num::encode(3), num::encode(5)]);
        assert!(num::to_bool(stack.last().unwrap()));
    }

    #[test]
    fn notif_takes_else() {
        let mut stack = vec![num::encode(0)];
        let script = [OP_NOTIF, OP_2, OP_ELSE, OP_3, OP_ENDIF];
        run(&script, &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(2)]);
    }

    #[test]
    fn unbalanced_conditionals_fail() {
        let mut stack = vec![num::encode(1)];
        assert_eq!(run(&[OP_IF], &mut stack), Err(ScriptError::UnbalancedConditional));
        let mut stack = Vec::new();
        assert_eq!(run(&[OP_ELSE], &mut stack), Err(ScriptError::UnbalancedConditional));
        let mut stack = Vec::new();
        assert_eq!(run(&[OP_ENDIF], &mut stack), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn truncated_pushdata_fails() {
        let mut stack = Vec::new();
        assert_eq!(
            run(&[OP_1, OP_DUP, OP_PUSHDATA1], &mut stack),
            Err(ScriptError::BadPush)
        );
        let mut stack = Vec::new();
        assert_eq!(run(&[OP_PUSHDATA2, 0x01], &mut stack), Err(ScriptError::BadPush));
        let mut stack = Vec::new();
        assert_eq!(
            run(&[OP_PUSHDATA1, 0x02, 0x01], &mut stack),
            Err(ScriptError::BadPush)
        );
    }

    #[test]
    fn disabled_opcode_fails_even_unexecuted() {
        let mut stack = vec![num::encode(0)];
        let script = [OP_IF, OP_CAT, OP_ENDIF];
        assert_eq!(run(&script, &mut stack), Err(ScriptError::DisabledOpcode));
    }

    #[test]
    fn op_return_fails() {
        let mut stack = Vec::new();
        assert_eq!(run(&[OP_RETURN], &mut stack), Err(ScriptError::OpReturn));
    }

    // --- stack ops ---

    #[test]
    fn dup_swap_drop() {
        let mut stack = Vec::new();
        run(&[OP_1, OP_2, OP_SWAP, OP_DUP, OP_DROP, OP_DROP], &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(2)]);
    }

    #[test]
    fn alt_stack_round_trip() {
        let mut stack = Vec::new();
        run(&[OP_7, OP_TOALTSTACK, OP_1, OP_FROMALTSTACK], &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(1), num::encode(7)]);
    }

    #[test]
    fn pick_and_roll() {
        let mut stack = Vec::new();
        run(&[OP_1, OP_2, OP_3, OP_2, OP_PICK], &mut stack).unwrap();
        assert_eq!(*stack.last().unwrap(), num::encode(1));
        let mut stack = Vec::new();
        run(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL], &mut stack).unwrap();
        assert_eq!(stack, vec![num::encode(2), num::encode(3), num::encode(1)]);
    }

    #[test]
    fn depth_and_size() {
        let mut stack = Vec::new();
        run(&[OP_1, OP_1, OP_DEPTH], &mut stack).unwrap();
        assert_eq!(*stack.last().unwrap(), num::encode(2));

        let mut stack = Vec::new();
        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 10]);
        script.push(OP_SIZE);
        run(&script, &mut stack).unwrap();
        assert_eq!(*stack.last().unwrap(), num::encode(10));
    }

    #[test]
    fn underflow_detected() {
        let mut stack = Vec::new();
        assert_eq!(run(&[OP_DROP], &mut stack), Err(ScriptError::StackUnderflow));
        let mut stack = vec![num::encode(1)];
        assert_eq!(run(&[OP_2DROP], &mut stack), Err(ScriptError::StackUnderflow));
    }

    // --- arithmetic ---

    #[test]
    fn numeric_ops() {
        let cases: &[(&[u8], i64)] = &[
            (&[OP_5, OP_1ADD], 6),
            (&[OP_5, OP_1SUB], 4),
            (&[OP_5, OP_NEGATE], -5),
            (&[OP_5, OP_NEGATE, OP_ABS], 5),
            (&[OP_0, OP_NOT], 1),
            (&[OP_5, OP_NOT], 0),
            (&[OP_5, OP_0NOTEQUAL], 1),
            (&[OP_7, OP_3, OP_SUB], 4),
            (&[OP_2, OP_3, OP_MIN], 2),
            (&[OP_2, OP_3, OP_MAX], 3),
            (&[OP_2, OP_1, OP_3, OP_WITHIN], 1),
            (&[OP_3, OP_1, OP_3, OP_WITHIN], 0),
        ];
        for (script, expected) in cases {
            let mut stack = Vec::new();
            run(script, &mut stack).unwrap();
            assert_eq!(*stack.last().unwrap(), num::encode(*expected), "script {script:02x?}");
        }
    }

    #[test]
    fn numequalverify() {
        let mut stack = Vec::new();
        run(&[OP_3, OP_3, OP_NUMEQUALVERIFY], &mut stack).unwrap();
        assert!(stack.is_empty());
        let mut stack = Vec::new();
        assert_eq!(
            run(&[OP_3, OP_4, OP_NUMEQUALVERIFY], &mut stack),
            Err(ScriptError::NumEqualVerify)
        );
    }

    #[test]
    fn equalverify() {
        let mut stack = Vec::new();
        assert_eq!(
            run(&[OP_1, OP_2, OP_EQUALVERIFY], &mut stack),
            Err(ScriptError::EqualVerify)
        );
    }

    // --- hashing ops ---

    #[test]
    fn hash_opcodes() {
        let mut stack = Vec::new();
        let mut script = Vec::new();
        push_data(&mut script, b"abc");
        script.push(OP_SHA256);
        run(&script, &mut stack).unwrap();
        assert_eq!(stack[0], Sha256::digest(b"abc").to_vec());

        let mut stack = Vec::new();
        let mut script = Vec::new();
        push_data(&mut script, b"abc");
        script.push(OP_HASH160);
        run(&script, &mut stack).unwrap();
        assert_eq!(stack[0], hash160(b"abc").to_vec());

        let mut stack = Vec::new();
        let mut script = Vec::new();
        push_data(&mut script, b"abc");
        script.push(OP_HASH256);
        run(&script, &mut stack).unwrap();
        assert_eq!(stack[0], hash256(b"abc").0.to_vec());
    }

    // --- limits ---

    #[test]
    fn op_count_limit() {
        let mut script = vec![OP_1];
        for _ in 0..202 {
            script.push(OP_DUP);
            script.push(OP_DROP);
        }
        let mut stack = Vec::new();
        assert_eq!(run(&script, &mut stack), Err(ScriptError::OpCount));
    }

    #[test]
    fn stack_size_limit() {
        let mut script = vec![OP_1];
        for _ in 0..1001 {
            script.push(OP_DUP);
        }
        let mut stack = Vec::new();
        assert_eq!(run(&script, &mut stack), Err(ScriptError::StackSize));
    }

    #[test]
    fn push_size_limit() {
        let mut script = Vec::new();
        push_data(&mut script, &vec![0u8; 521]);
        let mut stack = Vec::new();
        assert_eq!(run(&script, &mut stack), Err(ScriptError::PushSize));
    }

    #[test]
    fn minimaldata_enforced() {
        // Pushing 5 via a direct one-byte push instead of OP_5.
        let script = [0x01, 0x05];
        let mut stack = Vec::new();
        assert_eq!(
            run_flags(&script, &mut stack, VERIFY_MINIMALDATA),
            Err(ScriptError::MinimalData)
        );
        let mut stack = Vec::new();
        run(&script, &mut stack).unwrap();
    }

    // --- upgradable nops ---

    #[test]
    fn nops_discouraged_when_flagged() {
        let mut stack = Vec::new();
        run(&[OP_NOP1], &mut stack).unwrap();
        let mut stack = Vec::new();
        assert_eq!(
            run_flags(&[OP_NOP1], &mut stack, VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
            Err(ScriptError::DiscourageUpgradableNops)
        );
    }

    // --- locktime opcodes ---

    fn locktime_tx(lock_time: u32, sequence: u32, version: i32) -> Transaction {
        TxBuilder::new()
            .version(version)
            .input(
                OutPoint { txid: crate::hash::Hash256([1; 32]), index: 0 },
                vec![],
                sequence,
            )
            .output(1000, vec![])
            .lock_time(lock_time)
            .finalize()
    }

    fn run_cltv(operand: i64, tx: &Transaction) -> Result<(), ScriptError> {
        let mut script = Vec::new();
        crate::script::push_num(&mut script, operand);
        script.push(OP_CHECKLOCKTIMEVERIFY);
        let mut stack = Vec::new();
        execute(
            &script,
            &mut stack,
            tx,
            0,
            VERIFY_CHECKLOCKTIMEVERIFY | VERIFY_CHECKSEQUENCEVERIFY,
            0,
            SigVersion::Base,
        )
    }

    #[test]
    fn cltv_satisfied() {
        let tx = locktime_tx(100, 0xffff_fffe, 1);
        run_cltv(100, &tx).unwrap();
        run_cltv(50, &tx).unwrap();
    }

    #[test]
    fn cltv_unsatisfied() {
        let tx = locktime_tx(100, 0xffff_fffe, 1);
        assert_eq!(run_cltv(101, &tx), Err(ScriptError::UnsatisfiedLocktime));
    }

    #[test]
    fn cltv_kind_mismatch() {
        // Operand is a timestamp, tx locktime is a height.
        let tx = locktime_tx(100, 0xffff_fffe, 1);
        assert_eq!(
            run_cltv(LOCKTIME_THRESHOLD as i64, &tx),
            Err(ScriptError::UnsatisfiedLocktime)
        );
    }

    #[test]
    fn cltv_final_sequence_fails() {
        let tx = locktime_tx(100, SEQUENCE_FINAL, 1);
        assert_eq!(run_cltv(100, &tx), Err(ScriptError::UnsatisfiedLocktime));
    }

    #[test]
    fn cltv_negative_fails() {
        let tx = locktime_tx(100, 0xffff_fffe, 1);
        assert_eq!(run_cltv(-1, &tx), Err(ScriptError::NegativeLocktime));
    }

    fn run_csv(operand: i64, tx: &Transaction) -> Result<(), ScriptError> {
        let mut script = Vec::new();
        crate::script::push_num(&mut script, operand);
        script.push(OP_CHECKSEQUENCEVERIFY);
        let mut stack = Vec::new();
        execute(
            &script,
            &mut stack,
            tx,
            0,
            VERIFY_CHECKSEQUENCEVERIFY,
            0,
            SigVersion::Base,
        )
    }

    #[test]
    fn csv_satisfied() {
        let tx = locktime_tx(0, 10, 2);
        run_csv(10, &tx).unwrap();
        run_csv(5, &tx).unwrap();
    }

    #[test]
    fn csv_unsatisfied_value() {
        let tx = locktime_tx(0, 10, 2);
        assert_eq!(run_csv(11, &tx), Err(ScriptError::UnsatisfiedLocktime));
    }

    #[test]
    fn csv_operand_disable_bit_passes() {
        // Disable bit in the operand makes CSV a no-op.
        let tx = locktime_tx(0, 0, 1);
        run_csv(SEQUENCE_DISABLE_FLAG as i64, &tx).unwrap();
    }

    #[test]
    fn csv_input_disable_bit_fails() {
        let tx = locktime_tx(0, SEQUENCE_DISABLE_FLAG | 10, 2);
        assert_eq!(run_csv(10, &tx), Err(ScriptError::UnsatisfiedLocktime));
    }

    #[test]
    fn csv_type_mismatch_fails() {
        let tx = locktime_tx(0, 10, 2);
        assert_eq!(
            run_csv((SEQUENCE_TYPE_FLAG | 10) as i64, &tx),
            Err(ScriptError::UnsatisfiedLocktime)
        );
    }

    #[test]
    fn csv_version_one_fails() {
        let tx = locktime_tx(0, 10, 1);
        assert_eq!(run_csv(10, &tx), Err(ScriptError::UnsatisfiedLocktime));
    }

    // --- signature encoding ---

    #[test]
    fn empty_sig_checksig_pushes_false() {
        // Empty signature fails the check but does not error (no NULLFAIL).
        let tx = dummy_tx();
        let mut script = Vec::new();
        push_data(&mut script, &[]); // sig
        push_data(&mut script, &[0x02; 33]); // pubkey
        script.push(OP_CHECKSIG);
        let mut stack = Vec::new();
        execute(&script, &mut stack, &tx, 0, VERIFY_NONE, 0, SigVersion::Base).unwrap();
        assert_eq!(stack, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn garbage_sig_rejected_under_dersig() {
        let tx = dummy_tx();
        let mut script = Vec::new();
        push_data(&mut script, &[0x30, 0x01, 0x02]); // not DER
        push_data(&mut script, &[0x02; 33]);
        script.push(OP_CHECKSIG);
        let mut stack = Vec::new();
        assert_eq!(
            execute(&script, &mut stack, &tx, 0, VERIFY_DERSIG, 0, SigVersion::Base),
            Err(ScriptError::SigDer)
        );
    }

    #[test]
    fn bad_pubkey_rejected_under_strictenc() {
        let tx = dummy_tx();
        let mut script = Vec::new();
        push_data(&mut script, &[]);
        push_data(&mut script, &[0x05; 33]); // invalid prefix
        script.push(OP_CHECKSIG);
        let mut stack = Vec::new();
        assert_eq!(
            execute(&script, &mut stack, &tx, 0, VERIFY_STRICTENC, 0, SigVersion::Base),
            Err(ScriptError::PubKeyEncoding)
        );
    }

    #[test]
    fn multisig_dummy_consumed() {
        // 0-of-1 multisig succeeds and consumes the dummy.
        let tx = dummy_tx();
        let mut script = vec![OP_0, OP_0];
        push_data(&mut script, &[0x02; 33]);
        script.push(OP_1);
        script.push(OP_CHECKMULTISIG);
        let mut stack = Vec::new();
        execute(&script, &mut stack, &tx, 0, VERIFY_NONE, 0, SigVersion::Base).unwrap();
        assert_eq!(stack.len(), 1);
        assert!(num::to_bool(&stack[0]));
    }

    #[test]
    fn multisig_nonnull_dummy_rejected() {
        let tx = dummy_tx();
        let mut script = vec![OP_1, OP_0]; // dummy = 1
        push_data(&mut script, &[0x02; 33]);
        script.push(OP_1);
        script.push(OP_CHECKMULTISIG);
        let mut stack = Vec::new();
        assert_eq!(
            execute(&script, &mut stack, &tx, 0, VERIFY_NULLDUMMY, 0, SigVersion::Base),
            Err(ScriptError::SigNullDummy)
        );
    }

    #[test]
    fn multisig_pubkey_count_bounds() {
        let tx = dummy_tx();
        let mut script = vec![OP_0, OP_0];
        script.push(0x01);
        script.push(21); // 21 pubkeys claimed
        script.push(OP_CHECKMULTISIG);
        let mut stack = Vec::new();
        assert_eq!(
            execute(&script, &mut stack, &tx, 0, VERIFY_NONE, 0, SigVersion::Base),
            Err(ScriptError::PubKeyCount)
        );
    }

    // --- full signature verification ---

    use crate::script::sighash::SIGHASH_ALL;
    use crate::script::standard;
    use crate::script::STANDARD_VERIFY_FLAGS;

    fn keypair() -> (secp256k1::SecretKey, Vec<u8>) {
        let secret = secp256k1::SecretKey::from_slice(&[0x42; 32]).expect("valid key");
        let pubkey = secret.public_key(secp256k1::SECP256K1).serialize().to_vec();
        (secret, pubkey)
    }

    fn sign(secret: &secp256k1::SecretKey, digest: &crate::hash::Hash256) -> Vec<u8> {
        let message =
            secp256k1::Message::from_digest_slice(digest.as_bytes()).expect("32 bytes");
        let signature = secp256k1::SECP256K1.sign_ecdsa(&message, secret);
        let mut der = signature.serialize_der().to_vec();
        der.push(SIGHASH_ALL as u8);
        der
    }

    #[test]
    fn p2sh_spend_with_real_signature() {
        let (secret, pubkey) = keypair();
        let redeem = standard::p2pk(&pubkey);
        let script_pubkey = standard::p2sh(&hash160(&redeem));

        let tx = TxBuilder::new()
            .input(
                OutPoint { txid: crate::hash::Hash256([0x31; 32]), index: 0 },
                vec![],
                0xffff_ffff,
            )
            .output(90_000, standard::p2pkh(&[0xcd; 20]))
            .finalize();

        // The signature commits to the redeem script as the subscript.
        let digest = signature_hash(&tx, 0, &redeem, SIGHASH_ALL, SigVersion::Base, 0);
        let sig = sign(&secret, &digest);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &redeem);

        verify(
            &script_sig,
            &Vec::new(),
            &script_pubkey,
            &tx,
            0,
            STANDARD_VERIFY_FLAGS,
            100_000,
        )
        .expect("valid P2SH spend");

        // A corrupted signature fails the spend.
        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 0x01;
        let mut bad_script_sig = Vec::new();
        push_data(&mut bad_script_sig, &bad_sig);
        push_data(&mut bad_script_sig, &redeem);
        assert!(verify(
            &bad_script_sig,
            &Vec::new(),
            &script_pubkey,
            &tx,
            0,
            STANDARD_VERIFY_FLAGS,
            100_000,
        )
        .is_err());

        // Wrong redeem script misses the script hash.
        let wrong_redeem = standard::p2pk(&[0x02; 33]);
        let mut wrong_script_sig = Vec::new();
        push_data(&mut wrong_script_sig, &sig);
        push_data(&mut wrong_script_sig, &wrong_redeem);
        assert_eq!(
            verify(
                &wrong_script_sig,
                &Vec::new(),
                &script_pubkey,
                &tx,
                0,
                STANDARD_VERIFY_FLAGS,
                100_000,
            ),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2wpkh_spend_with_real_signature() {
        let (secret, pubkey) = keypair();
        let key_hash = hash160(&pubkey);
        let script_pubkey = standard::p2wpkh(&key_hash);
        let amount = 250_000;

        let tx = TxBuilder::new()
            .input(
                OutPoint { txid: crate::hash::Hash256([0x32; 32]), index: 1 },
                vec![],
                0xffff_ffff,
            )
            .output(240_000, standard::p2pkh(&[0xcd; 20]))
            .finalize();

        // BIP143: the script code is the implied P2PKH template and the
        // digest commits to the spent amount.
        let script_code = standard::p2pkh(&key_hash);
        let digest =
            signature_hash(&tx, 0, &script_code, SIGHASH_ALL, SigVersion::WitnessV0, amount);
        let sig = sign(&secret, &digest);
        let witness = vec![sig, pubkey];

        verify(
            &[],
            &witness,
            &script_pubkey,
            &tx,
            0,
            STANDARD_VERIFY_FLAGS,
            amount,
        )
        .expect("valid P2WPKH spend");

        // A different amount breaks the commitment.
        assert!(verify(
            &[],
            &witness,
            &script_pubkey,
            &tx,
            0,
            STANDARD_VERIFY_FLAGS,
            amount + 1,
        )
        .is_err());

        // A scriptSig on a native witness spend is malleation.
        assert_eq!(
            verify(
                &[OP_0],
                &witness,
                &script_pubkey,
                &tx,
                0,
                STANDARD_VERIFY_FLAGS,
                amount,
            ),
            Err(ScriptError::WitnessMalleated)
        );
    }

    #[test]
    fn p2wsh_spend_with_real_signature() {
        let (secret, pubkey) = keypair();
        let witness_script = standard::p2pk(&pubkey);
        let script_pubkey = standard::p2wsh(&sha256(&witness_script));
        let amount = 70_000;

        let tx = TxBuilder::new()
            .input(
                OutPoint { txid: crate::hash::Hash256([0x33; 32]), index: 0 },
                vec![],
                0xffff_ffff,
            )
            .output(60_000, standard::p2pkh(&[0xcd; 20]))
            .finalize();

        let digest =
            signature_hash(&tx, 0, &witness_script, SIGHASH_ALL, SigVersion::WitnessV0, amount);
        let sig = sign(&secret, &digest);
        let witness = vec![sig, witness_script.clone()];

        verify(&[], &witness, &script_pubkey, &tx, 0, STANDARD_VERIFY_FLAGS, amount)
            .expect("valid P2WSH spend");

        // A tampered witness script no longer hashes to the program.
        let mut bad_script = witness_script;
        bad_script.push(OP_NOP);
        let bad_witness = vec![witness[0].clone(), bad_script];
        assert_eq!(
            verify(&[], &bad_witness, &script_pubkey, &tx, 0, STANDARD_VERIFY_FLAGS, amount),
            Err(ScriptError::WitnessProgramMismatch)
        );
    }

    // --- determinism ---

    #[test]
    fn execution_is_deterministic() {
        let tx = dummy_tx();
        let script = [OP_1, OP_2, OP_ADD, OP_3, OP_EQUAL];
        let mut a = Vec::new();
        let mut b = Vec::new();
        execute(&script, &mut a, &tx, 0, VERIFY_NONE, 0, SigVersion::Base).unwrap();
        execute(&script, &mut b, &tx, 0, VERIFY_NONE, 0, SigVersion::Base).unwrap();
        assert_eq!(a, b);
    }
}
