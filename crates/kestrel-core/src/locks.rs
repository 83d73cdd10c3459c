//! Locktime and sequence-lock rules (BIP65 finality context, BIP68 relative
//! locks).

use crate::constants::{
    LOCKTIME_THRESHOLD, SEQUENCE_DISABLE_FLAG, SEQUENCE_FINAL, SEQUENCE_GRANULARITY,
    SEQUENCE_MASK, SEQUENCE_TYPE_FLAG,
};
use crate::tx::Transaction;

/// Verify sequence locks during evaluation.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;

/// Use median-time-past instead of the network-adjusted clock for time locks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;

/// Flags applied to transactions entering the mempool.
pub const STANDARD_LOCKTIME_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Whether a transaction is final at the given height and time.
///
/// A locktime of zero is always final. Otherwise the locktime is compared
/// against the height (below [`LOCKTIME_THRESHOLD`]) or the time, and a
/// not-yet-expired locktime can still be final if every input opted out with
/// [`SEQUENCE_FINAL`].
pub fn is_final(tx: &Transaction, height: u32, time: u64) -> bool {
    if tx.lock_time() == 0 {
        return true;
    }
    let threshold = if (tx.lock_time() as u64) < LOCKTIME_THRESHOLD as u64 {
        height as u64
    } else {
        time
    };
    if (tx.lock_time() as u64) < threshold {
        return true;
    }
    tx.inputs().iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// The earliest height and time at which a transaction's sequence locks are
/// satisfied. A value of `-1` means no constraint of that kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPoints {
    pub min_height: i64,
    pub min_time: i64,
}

impl LockPoints {
    pub const FREE: Self = Self { min_height: -1, min_time: -1 };
}

/// Compute BIP68 lock points for a transaction.
///
/// `prev_heights[i]` is the height of the block that created input `i`'s
/// coin (use the evaluation height for mempool parents). `median_time_at`
/// returns the median-time-past of the block *at* a height; time-based locks
/// measure from the MTP of the block before the coin's inclusion.
///
/// Sequence locks apply only to version ≥ 2 transactions and never to
/// coinbases; inputs with [`SEQUENCE_DISABLE_FLAG`] are skipped.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &[u32],
    median_time_at: impl Fn(u32) -> u64,
) -> LockPoints {
    debug_assert_eq!(prev_heights.len(), tx.inputs().len());

    let enforce = tx.version() >= 2 && flags & LOCKTIME_VERIFY_SEQUENCE != 0 && !tx.is_coinbase();
    if !enforce {
        return LockPoints::FREE;
    }

    let mut lock = LockPoints::FREE;
    for (input, &coin_height) in tx.inputs().iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_DISABLE_FLAG != 0 {
            continue;
        }
        let value = (input.sequence & SEQUENCE_MASK) as i64;
        if input.sequence & SEQUENCE_TYPE_FLAG != 0 {
            // Time-based: value is in 512-second granules measured from the
            // MTP of the block preceding the coin's inclusion.
            let base = median_time_at(coin_height.saturating_sub(1)) as i64;
            lock.min_time = lock.min_time.max(base + (value << SEQUENCE_GRANULARITY) - 1);
        } else {
            lock.min_height = lock.min_height.max(coin_height as i64 + value - 1);
        }
    }
    lock
}

/// Whether lock points are satisfied by a prospective block at `height`
/// whose median-time-past is `median_time`.
pub fn evaluate_sequence_locks(lock: LockPoints, height: u32, median_time: u64) -> bool {
    // The block at `height` has ancestors up to `height - 1`.
    if lock.min_height >= height as i64 {
        return false;
    }
    if lock.min_time >= median_time as i64 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash256;
    use crate::tx::{OutPoint, TxBuilder};

    fn tx_with(version: i32, lock_time: u32, sequences: &[u32]) -> Transaction {
        let mut builder = TxBuilder::new().version(version).lock_time(lock_time);
        for (i, &seq) in sequences.iter().enumerate() {
            builder = builder.input(
                OutPoint { txid: Hash256([i as u8 + 1; 32]), index: 0 },
                vec![],
                seq,
            );
        }
        builder.output(1, vec![]).finalize()
    }

    // --- finality ---

    #[test]
    fn zero_locktime_is_final() {
        let tx = tx_with(1, 0, &[0]);
        assert!(is_final(&tx, 0, 0));
    }

    #[test]
    fn height_locktime_boundary() {
        let tx = tx_with(1, 100, &[0]);
        assert!(!is_final(&tx, 100, 0));
        assert!(is_final(&tx, 101, 0));
    }

    #[test]
    fn threshold_switches_height_to_time() {
        // Exactly at the threshold: interpreted as a timestamp.
        let tx = tx_with(1, LOCKTIME_THRESHOLD, &[0]);
        assert!(!is_final(&tx, u32::MAX, LOCKTIME_THRESHOLD as u64));
        assert!(is_final(&tx, 0, LOCKTIME_THRESHOLD as u64 + 1));
        // One below: interpreted as a height.
        let tx = tx_with(1, LOCKTIME_THRESHOLD - 1, &[0]);
        assert!(is_final(&tx, LOCKTIME_THRESHOLD, 0));
    }

    #[test]
    fn final_sequences_override_locktime() {
        let tx = tx_with(1, 100, &[SEQUENCE_FINAL, SEQUENCE_FINAL]);
        assert!(is_final(&tx, 0, 0));
        let tx = tx_with(1, 100, &[SEQUENCE_FINAL, 0]);
        assert!(!is_final(&tx, 0, 0));
    }

    // --- sequence locks ---

    #[test]
    fn version_one_exempt() {
        let tx = tx_with(1, 0, &[10]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[50], |_| 0);
        assert_eq!(lock, LockPoints::FREE);
    }

    #[test]
    fn disable_flag_skips_input() {
        let tx = tx_with(2, 0, &[SEQUENCE_DISABLE_FLAG | 10]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[50], |_| 0);
        assert_eq!(lock, LockPoints::FREE);
    }

    #[test]
    fn height_based_lock() {
        // Coin created at height 50, relative lock of 10 blocks: spendable in
        // a block at height 60 (ancestor chain reaches 59).
        let tx = tx_with(2, 0, &[10]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[50], |_| 0);
        assert_eq!(lock.min_height, 59);
        assert!(!evaluate_sequence_locks(lock, 59, 0));
        assert!(evaluate_sequence_locks(lock, 60, 0));
    }

    #[test]
    fn time_based_lock() {
        let base_mtp = 1_000_000u64;
        let tx = tx_with(2, 0, &[SEQUENCE_TYPE_FLAG | 3]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[50], |h| {
            assert_eq!(h, 49);
            base_mtp
        });
        assert_eq!(lock.min_time, base_mtp as i64 + 3 * 512 - 1);
        assert!(!evaluate_sequence_locks(lock, 0, base_mtp + 3 * 512 - 1));
        assert!(evaluate_sequence_locks(lock, 0, base_mtp + 3 * 512));
    }

    #[test]
    fn mask_strips_high_bits() {
        // Bits above the mask (other than type/disable) are ignored.
        let tx = tx_with(2, 0, &[0x0020_0000 | 5]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[10], |_| 0);
        assert_eq!(lock.min_height, 14);
    }

    #[test]
    fn worst_input_wins() {
        let tx = tx_with(2, 0, &[5, 20]);
        let lock = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &[100, 100], |_| 0);
        assert_eq!(lock.min_height, 119);
    }

    #[test]
    fn flags_off_disables_enforcement() {
        let tx = tx_with(2, 0, &[10]);
        let lock = calculate_sequence_locks(&tx, 0, &[50], |_| 0);
        assert_eq!(lock, LockPoints::FREE);
    }
}
