//! Consensus constants. All monetary values are in satoshis.

/// One bitcoin in satoshis.
pub const COIN: i64 = 100_000_000;

/// Maximum amount of money that can ever exist.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Maximum block weight (BIP141).
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Witness scale factor used in weight and virtual-size computations.
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Maximum serialized base size of a block.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum sigop cost per block (witness-scaled).
pub const MAX_BLOCK_SIGOPS_COST: usize = 80_000;

/// Number of confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Locktime values at or above this are interpreted as unix timestamps,
/// below as block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number that disables locktime entirely when present on all
/// inputs.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// BIP68: if set, the sequence number has no relative-locktime meaning.
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;

/// BIP68: if set, the relative locktime is time-based (units of 512 s),
/// otherwise height-based.
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;

/// BIP68: mask extracting the relative-locktime value.
pub const SEQUENCE_MASK: u32 = 0x0000_ffff;

/// BIP68: shift converting a masked time-based sequence into seconds.
pub const SEQUENCE_GRANULARITY: u32 = 9;

/// Maximum number of public keys in a CHECKMULTISIG.
pub const MAX_MULTISIG_PUBKEYS: usize = 20;

/// Maximum combined size of the main and alt script stacks.
pub const MAX_SCRIPT_STACK: usize = 1000;

/// Maximum size of a single pushed element.
pub const MAX_SCRIPT_PUSH: usize = 520;

/// Maximum number of counted opcodes per script.
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum script size in bytes.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Blocks mined between difficulty retargets.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Target spacing between blocks, in seconds.
pub const TARGET_SPACING: u32 = 10 * 60;

/// Target time for a full retarget window, in seconds.
pub const TARGET_TIMESPAN: u32 = RETARGET_INTERVAL * TARGET_SPACING;

/// Number of ancestor timestamps used for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum allowed clock drift for block timestamps, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Maximum size of a relayed transaction's virtual size under policy.
pub const MAX_STANDARD_TX_VSIZE: usize = MAX_BLOCK_WEIGHT / WITNESS_SCALE_FACTOR / 10;

/// Maximum number of orphan transactions held in the mempool orphan pool.
pub const MAX_ORPHAN_TXS: usize = 100;

/// Maximum unconfirmed ancestors a mempool transaction may have.
pub const ANCESTOR_LIMIT: usize = 25;

/// Free-relay priority threshold: one coin aged 144 blocks over 250 bytes.
pub const FREE_THRESHOLD: f64 = (COIN as f64) * 144.0 / 250.0;

/// Half-life of the dynamic mempool minimum fee, in seconds.
pub const FEE_HALFLIFE: u64 = 60 * 60 * 12;

/// Block subsidy halving interval.
pub const HALVING_INTERVAL: u32 = 210_000;

/// Maximum wire message payload size.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Maximum number of inventory items in one inv/getdata message.
pub const MAX_INV_ITEMS: usize = 50_000;

/// Maximum number of headers in one headers message.
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Maximum number of hashes in a block locator.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Compute the block subsidy at a given height.
///
/// Halves every [`HALVING_INTERVAL`] blocks; returns zero once the shift
/// exhausts the initial 50-coin subsidy (64 halvings).
pub fn block_subsidy(height: u32) -> i64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}
