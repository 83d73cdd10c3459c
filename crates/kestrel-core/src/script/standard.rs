//! Standard output-script classification and template construction.
//!
//! Policy code relays only recognized script shapes; classification here is
//! shared by mempool standardness checks and sigop accounting.

use crate::script::opcodes::*;
use crate::script::{ops, push_data, small_int, witness_program};

/// Recognized output script shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    NonStandard,
    /// `<pubkey> OP_CHECKSIG`
    PubKey,
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    PubKeyHash,
    /// `OP_HASH160 <20> OP_EQUAL`
    ScriptHash,
    /// `OP_m <pubkeys...> OP_n OP_CHECKMULTISIG`
    Multisig,
    /// `OP_RETURN <pushes...>`
    NullData,
    /// `OP_0 <20>`
    WitnessV0KeyHash,
    /// `OP_0 <32>`
    WitnessV0ScriptHash,
    /// Future witness version.
    WitnessUnknown,
}

/// Maximum payload relayed in an OP_RETURN output.
pub const MAX_OP_RETURN_RELAY: usize = 83;

fn is_pubkey_bytes(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(0x02) | Some(0x03) => bytes.len() == 33,
        Some(0x04) => bytes.len() == 65,
        _ => false,
    }
}

/// Classify an output script.
pub fn classify(script: &[u8]) -> ScriptType {
    if let Some((version, program)) = witness_program(script) {
        return match (version, program.len()) {
            (0, 20) => ScriptType::WitnessV0KeyHash,
            (0, 32) => ScriptType::WitnessV0ScriptHash,
            (0, _) => ScriptType::NonStandard,
            _ => ScriptType::WitnessUnknown,
        };
    }

    // P2PKH.
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return ScriptType::PubKeyHash;
    }

    // P2SH.
    if crate::script::is_p2sh(script) {
        return ScriptType::ScriptHash;
    }

    // P2PK.
    if script.len() >= 35
        && (script[0] == 33 || script[0] == 65)
        && script.len() == script[0] as usize + 2
        && script[script.len() - 1] == OP_CHECKSIG
        && is_pubkey_bytes(&script[1..script.len() - 1])
    {
        return ScriptType::PubKey;
    }

    // Null data: OP_RETURN followed only by pushes, bounded size.
    if script.first() == Some(&OP_RETURN) {
        if script.len() > MAX_OP_RETURN_RELAY {
            return ScriptType::NonStandard;
        }
        let rest = &script[1..];
        if crate::script::is_push_only(rest) {
            return ScriptType::NullData;
        }
        return ScriptType::NonStandard;
    }

    // Bare multisig: OP_m <keys> OP_n OP_CHECKMULTISIG with 1<=m<=n<=3.
    if script.len() >= 3 && script[script.len() - 1] == OP_CHECKMULTISIG {
        let parsed: Result<Vec<_>, _> = ops(script).collect();
        if let Ok(parsed) = parsed {
            if parsed.len() >= 4 {
                let m = small_int(parsed[0].code);
                let n = small_int(parsed[parsed.len() - 2].code);
                if let (Some(m), Some(n)) = (m, n) {
                    let keys = &parsed[1..parsed.len() - 2];
                    if m >= 1
                        && m <= n
                        && n <= 3
                        && keys.len() == n as usize
                        && keys.iter().all(|op| is_pubkey_bytes(op.push))
                    {
                        return ScriptType::Multisig;
                    }
                }
            }
        }
    }

    ScriptType::NonStandard
}

// --- template builders ---

pub fn p2pk(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script, pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_HASH160, 0x14];
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn p2wpkh(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_0, 0x14];
    script.extend_from_slice(pubkey_hash);
    script
}

pub fn p2wsh(script_hash: &[u8; 32]) -> Vec<u8> {
    let mut script = vec![OP_0, 0x20];
    script.extend_from_slice(script_hash);
    script
}

pub fn null_data(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    push_data(&mut script, payload);
    script
}

// --- legacy addresses ---

/// Base58check address for a P2PKH or P2SH output script.
pub fn script_address(script: &[u8], mainnet: bool) -> Option<String> {
    use crate::base58;
    let (version, hash) = match classify(script) {
        ScriptType::PubKeyHash => (
            if mainnet { base58::VERSION_P2PKH } else { base58::VERSION_TESTNET_P2PKH },
            &script[3..23],
        ),
        ScriptType::ScriptHash => (
            if mainnet { base58::VERSION_P2SH } else { base58::VERSION_TESTNET_P2SH },
            &script[2..22],
        ),
        _ => return None,
    };
    let mut payload = vec![version];
    payload.extend_from_slice(hash);
    Some(base58::encode_check(&payload))
}

/// Output script for a base58check address.
pub fn address_script(address: &str) -> Option<Vec<u8>> {
    use crate::base58;
    let payload = base58::decode_check(address)?;
    if payload.len() != 21 {
        return None;
    }
    let hash: [u8; 20] = payload[1..].try_into().ok()?;
    match payload[0] {
        base58::VERSION_P2PKH | base58::VERSION_TESTNET_P2PKH => Some(p2pkh(&hash)),
        base58::VERSION_P2SH | base58::VERSION_TESTNET_P2SH => Some(p2sh(&hash)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash160, sha256};

    fn compressed_key(seed: u8) -> Vec<u8> {
        let mut key = vec![0x02];
        key.extend_from_slice(&[seed; 32]);
        key
    }

    #[test]
    fn classify_p2pkh() {
        assert_eq!(classify(&p2pkh(&[0xaa; 20])), ScriptType::PubKeyHash);
    }

    #[test]
    fn classify_p2sh() {
        assert_eq!(classify(&p2sh(&[0xbb; 20])), ScriptType::ScriptHash);
    }

    #[test]
    fn classify_p2pk() {
        assert_eq!(classify(&p2pk(&compressed_key(1))), ScriptType::PubKey);
        let mut uncompressed = vec![0x04];
        uncompressed.extend_from_slice(&[0x11; 64]);
        assert_eq!(classify(&p2pk(&uncompressed)), ScriptType::PubKey);
    }

    #[test]
    fn classify_witness() {
        assert_eq!(classify(&p2wpkh(&[0xcc; 20])), ScriptType::WitnessV0KeyHash);
        assert_eq!(classify(&p2wsh(&[0xdd; 32])), ScriptType::WitnessV0ScriptHash);
        // Future version.
        let mut v1 = vec![OP_1, 0x20];
        v1.extend_from_slice(&[0xee; 32]);
        assert_eq!(classify(&v1), ScriptType::WitnessUnknown);
    }

    #[test]
    fn classify_null_data() {
        assert_eq!(classify(&null_data(b"hello")), ScriptType::NullData);
        // 80-byte payload is exactly the relay bound; 81 exceeds it.
        assert_eq!(classify(&null_data(&[0xaa; 80])), ScriptType::NullData);
        assert_eq!(classify(&null_data(&[0xaa; 81])), ScriptType::NonStandard);
        assert_eq!(classify(&[OP_RETURN]), ScriptType::NullData);
    }

    #[test]
    fn classify_multisig() {
        let mut script = vec![OP_1];
        push_data(&mut script, &compressed_key(1));
        push_data(&mut script, &compressed_key(2));
        script.push(OP_2);
        script.push(OP_CHECKMULTISIG);
        assert_eq!(classify(&script), ScriptType::Multisig);
    }

    #[test]
    fn classify_multisig_rejects_large_n() {
        let mut script = vec![OP_1];
        for i in 0..4 {
            push_data(&mut script, &compressed_key(i));
        }
        script.push(OP_4);
        script.push(OP_CHECKMULTISIG);
        assert_eq!(classify(&script), ScriptType::NonStandard);
    }

    #[test]
    fn classify_garbage() {
        assert_eq!(classify(&[]), ScriptType::NonStandard);
        assert_eq!(classify(&[OP_DUP, OP_DROP]), ScriptType::NonStandard);
        // Truncated P2PKH.
        assert_eq!(classify(&p2pkh(&[0xaa; 20])[..24]), ScriptType::NonStandard);
    }

    #[test]
    fn address_round_trip() {
        let p2pkh_script = p2pkh(&[0x11; 20]);
        let address = script_address(&p2pkh_script, true).unwrap();
        assert!(address.starts_with('1'));
        assert_eq!(address_script(&address).unwrap(), p2pkh_script);

        let p2sh_script = p2sh(&[0x22; 20]);
        let address = script_address(&p2sh_script, true).unwrap();
        assert!(address.starts_with('3'));
        assert_eq!(address_script(&address).unwrap(), p2sh_script);

        // Witness scripts have no base58 form.
        assert!(script_address(&p2wpkh(&[0x33; 20]), true).is_none());
        assert!(address_script("not-an-address").is_none());
    }

    #[test]
    fn templates_use_expected_hashes() {
        let key = compressed_key(7);
        let key_hash = hash160(&key);
        let script = p2pkh(&key_hash);
        assert_eq!(&script[3..23], &key_hash);

        let redeem = p2pk(&key);
        let redeem_hash = sha256(&redeem);
        let wsh = p2wsh(&redeem_hash);
        assert_eq!(&wsh[2..], &redeem_hash);
    }
}
