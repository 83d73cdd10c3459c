//! Fee rates and the dynamic mempool minimum fee.
//!
//! Rates are satoshis per 1000 virtual bytes. The dynamic minimum rises when
//! eviction sheds low-rate packages and decays geometrically afterwards,
//! with the half-life shortened while the pool is mostly empty.

use kestrel_core::constants::FEE_HALFLIFE;

/// Default relay floor: 1000 satoshis per kvB.
pub const MIN_RELAY_FEE_RATE: u64 = 1000;

/// The reasonable incremental step added on eviction bumps, and the floor
/// below which the dynamic rate snaps to zero.
pub const MIN_REASONABLE_FEE_RATE: u64 = 1000;

/// Fee owed by a transaction of `vsize` at `rate` sat/kvB, rounded up.
pub fn fee_for(rate: u64, vsize: usize) -> i64 {
    ((rate as u128 * vsize as u128).div_ceil(1000)) as i64
}

/// Fee rate in sat/kvB implied by an absolute fee over a size.
pub fn rate_for(fee: i64, vsize: usize) -> u64 {
    if vsize == 0 {
        return u64::MAX;
    }
    ((fee.max(0) as u128) * 1000 / vsize as u128).min(u64::MAX as u128) as u64
}

/// Adaptive fee floor that absorbs mempool pressure.
#[derive(Debug, Clone)]
pub struct DynamicMinFee {
    rate: f64,
    last_update: u64,
    /// Decay is held until a block has been seen after the last bump.
    block_since_bump: bool,
}

impl DynamicMinFee {
    pub fn new(now: u64) -> Self {
        Self { rate: 0.0, last_update: now, block_since_bump: false }
    }

    /// Raise the floor after evicting a package at `evicted_rate`.
    pub fn bump(&mut self, evicted_rate: u64, now: u64) {
        let candidate = (evicted_rate + MIN_REASONABLE_FEE_RATE) as f64;
        let current = self.current(now, 1.0);
        if candidate > current {
            self.rate = candidate;
            self.last_update = now;
        }
        self.block_since_bump = false;
    }

    /// A block arrived; decay may resume.
    pub fn on_block(&mut self) {
        self.block_since_bump = true;
    }

    /// Current floor in sat/kvB.
    ///
    /// `usage` is pool bytes over capacity in `[0, 1]`; a mostly empty pool
    /// quarters or halves the decay half-life.
    pub fn rate(&mut self, now: u64, usage: f64) -> u64 {
        let rate = self.current(now, usage);
        self.rate = rate;
        self.last_update = now;
        if rate < (MIN_REASONABLE_FEE_RATE / 2) as f64 {
            self.rate = 0.0;
            return 0;
        }
        rate as u64
    }

    fn current(&self, now: u64, usage: f64) -> f64 {
        if self.rate <= 0.0 {
            return 0.0;
        }
        if !self.block_since_bump {
            return self.rate;
        }
        let halflife = if usage < 0.25 {
            FEE_HALFLIFE / 4
        } else if usage < 0.5 {
            FEE_HALFLIFE / 2
        } else {
            FEE_HALFLIFE
        };
        let elapsed = now.saturating_sub(self.last_update) as f64;
        self.rate * (0.5f64).powf(elapsed / halflife as f64)
    }
}
