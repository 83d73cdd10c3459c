//! Error types for the Kestrel consensus core.

use thiserror::Error;

use crate::hash::Hash256;

/// Wire codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data at offset {0}")] UnexpectedEnd(usize),
    #[error("non-canonical compact size")] NonCanonicalSize,
    #[error("oversized allocation: {size} > {max}")] OversizedAllocation { size: u64, max: u64 },
    #[error("trailing bytes after decode: {0}")] TrailingBytes(usize),
    #[error("invalid value: {0}")] InvalidValue(String),
}

/// Script interpreter failures. Each variant is a tagged reject reason; the
/// opcode and instruction pointer are carried for diagnostics where known.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("unknown or malformed opcode")] BadOpcode,
    #[error("disabled opcode")] DisabledOpcode,
    #[error("stack underflow")] StackUnderflow,
    #[error("invalid stack operation")] InvalidStackOperation,
    #[error("truncated push")] BadPush,
    #[error("non-minimal push encoding")] MinimalData,
    #[error("push exceeds element size limit")] PushSize,
    #[error("opcode count limit exceeded")] OpCount,
    #[error("EQUALVERIFY failed")] EqualVerify,
    #[error("NUMEQUALVERIFY failed")] NumEqualVerify,
    #[error("CHECKSIGVERIFY failed")] CheckSigVerify,
    #[error("CHECKMULTISIGVERIFY failed")] CheckMultisigVerify,
    #[error("VERIFY failed")] Verify,
    #[error("stack size limit exceeded")] StackSize,
    #[error("signature count out of range")] SigCount,
    #[error("pubkey count out of range")] PubKeyCount,
    #[error("scriptSig is not push-only")] SigPushOnly,
    #[error("non-DER signature encoding")] SigDer,
    #[error("invalid signature hash type")] SigHashType,
    #[error("signature s value too high")] SigHighS,
    #[error("invalid pubkey encoding")] PubKeyEncoding,
    #[error("CHECKMULTISIG dummy element not null")] SigNullDummy,
    #[error("signature not null after failed check")] SigNullFail,
    #[error("witness program hash mismatch")] WitnessProgramMismatch,
    #[error("witness program has wrong length")] WitnessProgramWrongLength,
    #[error("witness program witness is empty")] WitnessProgramEmpty,
    #[error("witness was malleated")] WitnessMalleated,
    #[error("witness used with non-witness-aware checks")] WitnessUnexpected,
    #[error("non-compressed pubkey in witness")] WitnessPubKeyType,
    #[error("IF argument not minimal")] MinimalIf,
    #[error("upgradable NOP used")] DiscourageUpgradableNops,
    #[error("upgradable witness program used")] DiscourageUpgradableWitnessProgram,
    #[error("stack not clean after evaluation")] CleanStack,
    #[error("negative locktime operand")] NegativeLocktime,
    #[error("locktime requirement not satisfied")] UnsatisfiedLocktime,
    #[error("unbalanced conditional")] UnbalancedConditional,
    #[error("OP_RETURN encountered")] OpReturn,
    #[error("script is too large")] ScriptSize,
    #[error("evaluated false")] EvalFalse,
    #[error("number overflow")] NumOverflow,
    #[error("non-minimal number encoding")] NumMinimalData,
}

/// Context-free transaction check failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("empty inputs")] EmptyInputs,
    #[error("empty outputs")] EmptyOutputs,
    #[error("oversized transaction: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("negative output value at index {0}")] NegativeOutput(usize),
    #[error("output value above MAX_MONEY at index {0}")] OutputTooLarge(usize),
    #[error("total output value overflows")] OutputOverflow,
    #[error("duplicate input outpoint: {0}")] DuplicateInput(String),
    #[error("coinbase scriptSig length out of range: {0}")] BadCoinbaseLength(usize),
    #[error("null previous outpoint in non-coinbase input {0}")] NullInput(usize),
}

/// Reject categories carried by [`VerifyError`], mirroring the wire
/// `reject` ccodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

impl RejectCode {
    /// Wire byte for the reject message.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Malformed => 0x01,
            Self::Invalid => 0x10,
            Self::Obsolete => 0x11,
            Self::Duplicate => 0x12,
            Self::Nonstandard => 0x40,
            Self::Dust => 0x41,
            Self::InsufficientFee => 0x42,
            Self::Checkpoint => 0x43,
        }
    }
}

/// A consensus or policy rejection from chain or mempool validation.
///
/// `score` feeds peer misbehavior accounting; `-1` suppresses the outgoing
/// reject packet entirely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification failed ({code:?}): {reason}")]
pub struct VerifyError {
    pub code: RejectCode,
    pub reason: &'static str,
    pub score: i32,
    pub hash: Option<Hash256>,
    pub height: Option<u32>,
}

impl VerifyError {
    pub fn new(code: RejectCode, reason: &'static str, score: i32) -> Self {
        Self { code, reason, score, hash: None, height: None }
    }

    pub fn with_hash(mut self, hash: Hash256) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }
}
