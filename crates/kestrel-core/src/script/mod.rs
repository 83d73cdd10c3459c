//! Script: parsing, verification flags, sigop accounting, and the
//! interpreter.
//!
//! Scripts are plain byte strings; this module provides the structured view
//! over them. The interpreter itself lives in [`interpreter`], signature
//! hashing in [`sighash`], and output classification in [`standard`].

pub mod interpreter;
pub mod num;
pub mod opcodes;
pub mod sighash;
pub mod standard;

use crate::error::ScriptError;

use opcodes::*;

// --- verification flags ---

pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict pubkey/hashtype encodings.
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER signature encoding.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Enforce low-S signatures.
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// CHECKMULTISIG dummy must be empty.
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// scriptSig must be push-only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Pushes must use their shortest encoding.
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Fail on upgradable NOPs.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Exactly one element may remain after evaluation.
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
/// BIP65.
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// BIP112.
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
/// BIP141 witness evaluation.
pub const VERIFY_WITNESS: u32 = 1 << 11;
/// Fail on witness versions this node does not understand.
pub const VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: u32 = 1 << 12;
/// IF operands must be empty or exactly 0x01 under witness v0.
pub const VERIFY_MINIMALIF: u32 = 1 << 13;
/// A failed signature check must consume an empty signature.
pub const VERIFY_NULLFAIL: u32 = 1 << 14;
/// Witness v0 pubkeys must be compressed.
pub const VERIFY_WITNESS_PUBKEYTYPE: u32 = 1 << 15;

/// Flags every block must satisfy once P2SH is active.
pub const MANDATORY_VERIFY_FLAGS: u32 = VERIFY_P2SH;

/// Flags applied to transactions entering the mempool.
pub const STANDARD_VERIFY_FLAGS: u32 = MANDATORY_VERIFY_FLAGS
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_SIGPUSHONLY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS
    | VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | VERIFY_MINIMALIF
    | VERIFY_NULLFAIL
    | VERIFY_WITNESS_PUBKEYTYPE;

/// Which signature-hashing scheme a script executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVersion {
    /// Legacy scripts and P2SH redeem scripts.
    Base,
    /// BIP143 witness v0 programs.
    WitnessV0,
}

/// One parsed script operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op<'a> {
    /// The opcode byte.
    pub code: u8,
    /// Pushed data for push opcodes, empty otherwise.
    pub push: &'a [u8],
    /// Byte offset of this op within the script.
    pub offset: usize,
}

/// Parse the operation starting at `pos`.
///
/// Returns the op and the offset of the next one. Truncated pushes fail
/// with [`ScriptError::BadPush`].
pub fn next_op(script: &[u8], pos: usize) -> Result<(Op<'_>, usize), ScriptError> {
    let code = *script.get(pos).ok_or(ScriptError::BadOpcode)?;
    let mut cursor = pos + 1;

    let push_len = match code {
        0x01..=0x4b => code as usize,
        OP_PUSHDATA1 => {
            let len = *script.get(cursor).ok_or(ScriptError::BadPush)? as usize;
            cursor += 1;
            len
        }
        OP_PUSHDATA2 => {
            let bytes = script.get(cursor..cursor + 2).ok_or(ScriptError::BadPush)?;
            cursor += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = script.get(cursor..cursor + 4).ok_or(ScriptError::BadPush)?;
            cursor += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        _ => 0,
    };

    let push = script
        .get(cursor..cursor + push_len)
        .ok_or(ScriptError::BadPush)?;
    Ok((Op { code, push, offset: pos }, cursor + push_len))
}

/// Iterate over a script's operations.
pub fn ops(script: &[u8]) -> OpIter<'_> {
    OpIter { script, pos: 0 }
}

pub struct OpIter<'a> {
    script: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for OpIter<'a> {
    type Item = Result<Op<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.script.len() {
            return None;
        }
        match next_op(self.script, self.pos) {
            Ok((op, next)) => {
                self.pos = next;
                Some(Ok(op))
            }
            Err(e) => {
                self.pos = self.script.len();
                Some(Err(e))
            }
        }
    }
}

/// Whether a push op uses the shortest possible encoding for its data.
pub fn is_minimal_push(code: u8, data: &[u8]) -> bool {
    match data.len() {
        0 => code == OP_0,
        1 if data[0] >= 1 && data[0] <= 16 => code == OP_1 + data[0] - 1,
        1 if data[0] == 0x81 => code == OP_1NEGATE,
        len if len <= 75 => code as usize == len,
        len if len <= 255 => code == OP_PUSHDATA1,
        len if len <= 65535 => code == OP_PUSHDATA2,
        _ => code == OP_PUSHDATA4,
    }
}

/// Whether every operation in the script is a push (scriptSig requirement
/// under SIGPUSHONLY and P2SH).
pub fn is_push_only(script: &[u8]) -> bool {
    for op in ops(script) {
        match op {
            Ok(op) if op.code <= OP_16 => continue,
            _ => return false,
        }
    }
    true
}

/// Append the minimal push of `data` to a script.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        1 if data[0] >= 1 && data[0] <= 16 => script.push(OP_1 + data[0] - 1),
        1 if data[0] == 0x81 => script.push(OP_1NEGATE),
        len if len <= 75 => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len if len <= 255 => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len if len <= 65535 => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Append a number push in minimal form.
pub fn push_num(script: &mut Vec<u8>, value: i64) {
    if value == 0 {
        script.push(OP_0);
    } else if (1..=16).contains(&value) {
        script.push(OP_1 + (value as u8) - 1);
    } else if value == -1 {
        script.push(OP_1NEGATE);
    } else {
        push_data(script, &num::encode(value));
    }
}

/// Remove every occurrence of the exact push of `data` from a script.
///
/// Pre-segwit signature hashing deletes the signature being checked from the
/// subscript.
pub fn find_and_delete(script: &[u8], data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return script.to_vec();
    }
    let mut target = Vec::new();
    push_data(&mut target, data);
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0;
    while pos < script.len() {
        if script[pos..].starts_with(&target) {
            pos += target.len();
            continue;
        }
        match next_op(script, pos) {
            Ok((_, next)) => {
                out.extend_from_slice(&script[pos..next]);
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

/// Detect a witness program: version byte plus a single 2..=40-byte push.
///
/// Returns `(version, program)`.
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        v @ OP_1..=OP_16 => v - OP_1 + 1,
        _ => return None,
    };
    let push_len = script[1] as usize;
    if !(2..=40).contains(&push_len) || script.len() != push_len + 2 {
        return None;
    }
    Some((version, &script[2..]))
}

/// Whether the script is the P2SH template `HASH160 <20> EQUAL`.
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23
        && script[0] == OP_HASH160
        && script[1] == 0x14
        && script[22] == OP_EQUAL
}

/// Count legacy signature operations.
///
/// `accurate` uses the preceding small-int push to size CHECKMULTISIG;
/// otherwise multisig counts the worst case of 20.
pub fn count_sigops(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut last_op = 0xff;
    for op in ops(script) {
        let Ok(op) = op else { break };
        match op.code {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match small_int(last_op) {
                    Some(n) if accurate => n as usize,
                    _ => crate::constants::MAX_MULTISIG_PUBKEYS,
                };
            }
            _ => {}
        }
        last_op = op.code;
    }
    count
}

/// The last push of a scriptSig, which P2SH treats as the redeem script.
pub fn last_push(script: &[u8]) -> Option<Vec<u8>> {
    let mut last = None;
    for op in ops(script) {
        match op {
            Ok(op) if op.code <= OP_PUSHDATA4 => last = Some(op.push.to_vec()),
            Ok(_) => return None,
            Err(_) => return None,
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- parsing ---

    #[test]
    fn parse_direct_pushes() {
        let mut script = vec![0x02, 0xaa, 0xbb];
        script.push(OP_CHECKSIG);
        let parsed: Vec<_> = ops(&script).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].push, &[0xaa, 0xbb]);
        assert_eq!(parsed[1].code, OP_CHECKSIG);
    }

    #[test]
    fn parse_two_pushes_then_checksig() {
        // Push 32, push 32, OP_CHECKSIG: decode, re-encode, byte equality.
        let b1: Vec<u8> = (0x00..0x20).collect();
        let b2: Vec<u8> = (0x10..0x30).collect();
        let mut script = Vec::new();
        script.push(0x20);
        script.extend_from_slice(&b1);
        script.push(0x20);
        script.extend_from_slice(&b2);
        script.push(OP_CHECKSIG);

        let parsed: Vec<_> = ops(&script).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].push, &b1[..]);
        assert_eq!(parsed[1].push, &b2[..]);
        assert_eq!(parsed[2].code, OP_CHECKSIG);

        // Re-encode from the parsed ops.
        let mut rebuilt = Vec::new();
        push_data(&mut rebuilt, parsed[0].push);
        push_data(&mut rebuilt, parsed[1].push);
        rebuilt.push(OP_CHECKSIG);
        assert_eq!(rebuilt, script);
    }

    #[test]
    fn parse_pushdata_forms() {
        for (len, expect_op) in [(75usize, 75u8), (76, OP_PUSHDATA1), (255, OP_PUSHDATA1),
                                 (256, OP_PUSHDATA2), (65535, OP_PUSHDATA2), (65536, OP_PUSHDATA4)] {
            let data = vec![0x5a; len];
            let mut script = Vec::new();
            push_data(&mut script, &data);
            assert_eq!(script[0], expect_op, "len {len}");
            let parsed: Vec<_> = ops(&script).collect::<Result<_, _>>().unwrap();
            assert_eq!(parsed.len(), 1);
            assert_eq!(parsed[0].push.len(), len);
        }
    }

    #[test]
    fn truncated_pushes_fail() {
        // OP_1 OP_DUP OP_PUSHDATA1 with no length byte.
        let script = [OP_1, OP_DUP, OP_PUSHDATA1];
        let result: Result<Vec<_>, _> = ops(&script).collect();
        assert_eq!(result.unwrap_err(), ScriptError::BadPush);
        // OP_PUSHDATA2 with a one-byte length.
        let result: Result<Vec<_>, _> = ops(&[OP_PUSHDATA2, 0x01]).collect();
        assert_eq!(result.unwrap_err(), ScriptError::BadPush);
        // OP_PUSHDATA1 claiming 2 bytes with only 1 present.
        let result: Result<Vec<_>, _> = ops(&[OP_PUSHDATA1, 0x02, 0x01]).collect();
        assert_eq!(result.unwrap_err(), ScriptError::BadPush);
    }

    // --- minimal pushes ---

    #[test]
    fn minimal_push_rules() {
        assert!(is_minimal_push(OP_0, &[]));
        assert!(is_minimal_push(0x01, &[0x00]));
        assert!(is_minimal_push(OP_5, &[5]));
        assert!(!is_minimal_push(0x01, &[5]));
        assert!(is_minimal_push(OP_1NEGATE, &[0x81]));
        assert!(is_minimal_push(0x4b, &[0xaa; 75]));
        assert!(!is_minimal_push(OP_PUSHDATA1, &[0xaa; 75]));
        assert!(is_minimal_push(OP_PUSHDATA1, &[0xaa; 76]));
        assert!(!is_minimal_push(OP_PUSHDATA2, &[0xaa; 76]));
    }

    #[test]
    fn push_only_detection() {
        let mut script = Vec::new();
        push_data(&mut script, &[1, 2, 3]);
        script.push(OP_16);
        assert!(is_push_only(&script));
        script.push(OP_DUP);
        assert!(!is_push_only(&script));
    }

    // --- find_and_delete ---

    #[test]
    fn find_and_delete_removes_exact_push() {
        let sig = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01];
        let mut script = Vec::new();
        push_data(&mut script, &sig);
        script.push(OP_CHECKSIG);
        let cleaned = find_and_delete(&script, &sig);
        assert_eq!(cleaned, vec![OP_CHECKSIG]);
    }

    #[test]
    fn find_and_delete_ignores_partial_match() {
        // The data appears raw (not as a push), so nothing is removed.
        let script = vec![OP_DUP, 0xaa, OP_DUP];
        assert_eq!(find_and_delete(&script, &[0xaa]), script);
    }

    // --- witness programs ---

    #[test]
    fn witness_program_detection() {
        let mut p2wpkh = vec![OP_0, 0x14];
        p2wpkh.extend_from_slice(&[0x11; 20]);
        assert_eq!(witness_program(&p2wpkh), Some((0, &[0x11; 20][..])));

        let mut p2wsh = vec![OP_0, 0x20];
        p2wsh.extend_from_slice(&[0x22; 32]);
        assert_eq!(witness_program(&p2wsh), Some((0, &[0x22; 32][..])));

        let mut v1 = vec![OP_1, 0x20];
        v1.extend_from_slice(&[0x33; 32]);
        assert_eq!(witness_program(&v1).map(|(v, _)| v), Some(1));

        // Too-short program.
        assert_eq!(witness_program(&[OP_0, 0x01, 0xaa]), None);
        // Trailing bytes.
        let mut trailing = p2wpkh.clone();
        trailing.push(0x00);
        assert_eq!(witness_program(&trailing), None);
    }

    #[test]
    fn p2sh_detection() {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[0x44; 20]);
        script.push(OP_EQUAL);
        assert!(is_p2sh(&script));
        script.push(OP_NOP);
        assert!(!is_p2sh(&script));
    }

    // --- sigops ---

    #[test]
    fn sigop_counting() {
        let script = vec![OP_CHECKSIG, OP_CHECKSIGVERIFY];
        assert_eq!(count_sigops(&script, false), 2);

        let multisig = vec![OP_2, OP_CHECKMULTISIG];
        assert_eq!(count_sigops(&multisig, true), 2);
        assert_eq!(count_sigops(&multisig, false), 20);

        let bare_multisig = vec![OP_CHECKMULTISIG];
        assert_eq!(count_sigops(&bare_multisig, true), 20);
    }

    #[test]
    fn last_push_extracts_redeem() {
        let redeem = vec![OP_1, OP_CHECKSIG];
        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 10]);
        push_data(&mut script, &redeem);
        assert_eq!(last_push(&script), Some(redeem));
        // Non-push op disqualifies.
        script.push(OP_DUP);
        assert_eq!(last_push(&script), None);
    }
}
