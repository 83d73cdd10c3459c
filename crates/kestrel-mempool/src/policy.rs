//! Relay standardness policy.
//!
//! Policy is stricter than consensus: nonstandard transactions are refused
//! relay but remain valid in blocks. These checks are the shape gate of the
//! admission pipeline; script execution policy lives in the interpreter's
//! standard flag set.

use kestrel_core::constants::MAX_STANDARD_TX_VSIZE;
use kestrel_core::script::standard::{classify, ScriptType};
use kestrel_core::script::{self};
use kestrel_core::tx::Transaction;

/// Maximum scriptSig size relayed.
pub const MAX_STANDARD_SCRIPTSIG: usize = 1650;

/// Maximum accepted transaction version.
pub const MAX_TX_VERSION: i32 = 2;

/// Dust threshold: an output is dust when spending it would cost more than
/// a third of its value at the relay rate.
pub fn is_dust(value: i64, script_pubkey: &[u8], relay_rate: u64) -> bool {
    if classify(script_pubkey) == ScriptType::NullData {
        return false;
    }
    // 148 vbytes to spend a typical output plus the output's own size.
    let spend_cost = 148 + 8 + 1 + script_pubkey.len();
    let threshold = crate::fees::fee_for(relay_rate, spend_cost) * 3;
    value < threshold
}

/// Reasons a transaction fails standardness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonstandard {
    Version,
    TxSize,
    ScriptSigSize,
    ScriptSigNotPushOnly,
    ScriptPubKey,
    Dust,
    MultiOpReturn,
}

impl Nonstandard {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::TxSize => "tx-size",
            Self::ScriptSigSize => "scriptsig-size",
            Self::ScriptSigNotPushOnly => "scriptsig-not-pushonly",
            Self::ScriptPubKey => "scriptpubkey",
            Self::Dust => "dust",
            Self::MultiOpReturn => "multi-op-return",
        }
    }
}

/// The standardness gate applied before any script runs.
pub fn check_standard(tx: &Transaction, relay_rate: u64) -> Result<(), Nonstandard> {
    if tx.version() < 1 || tx.version() > MAX_TX_VERSION {
        return Err(Nonstandard::Version);
    }
    if tx.vsize() > MAX_STANDARD_TX_VSIZE {
        return Err(Nonstandard::TxSize);
    }
    for input in tx.inputs() {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG {
            return Err(Nonstandard::ScriptSigSize);
        }
        if !script::is_push_only(&input.script_sig) {
            return Err(Nonstandard::ScriptSigNotPushOnly);
        }
    }
    let mut null_data = 0;
    for output in tx.outputs() {
        match classify(&output.script_pubkey) {
            ScriptType::NonStandard | ScriptType::WitnessUnknown => {
                return Err(Nonstandard::ScriptPubKey);
            }
            ScriptType::NullData => null_data += 1,
            _ => {
                if is_dust(output.value, &output.script_pubkey, crate::fees::MIN_RELAY_FEE_RATE) {
                    return Err(Nonstandard::Dust);
                }
            }
        }
    }
    if null_data > 1 {
        return Err(Nonstandard::MultiOpReturn);
    }
    Ok(())
}
