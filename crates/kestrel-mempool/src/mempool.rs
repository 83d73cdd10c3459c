//! The mempool: bounded storage of unconfirmed transactions.
//!
//! Admission runs the full pipeline — sanity, standardness, finality,
//! duplicate and conflict checks, coin resolution (orphaning on missing
//! parents), the fee gate, ancestor bounds, and script verification under
//! the standard flag set with a mandatory-flag retry to classify failures.
//! Overflow evicts the lowest-fee-rate packages and raises the dynamic
//! minimum fee.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, info, trace};

use kestrel_core::block::Block;
use kestrel_core::constants::{ANCESTOR_LIMIT, FREE_THRESHOLD, MAX_ORPHAN_TXS};
use kestrel_core::error::{RejectCode, VerifyError};
use kestrel_core::hash::{hash160, Hash256};
use kestrel_core::locks::STANDARD_LOCKTIME_FLAGS;
use kestrel_core::script::{interpreter, MANDATORY_VERIFY_FLAGS, STANDARD_VERIFY_FLAGS};
use kestrel_core::tx::{Coin, OutPoint, Transaction};

use crate::error::MempoolError;
use crate::fees::{fee_for, rate_for, DynamicMinFee, MIN_RELAY_FEE_RATE};
use crate::orphans::OrphanPool;
use crate::policy;

/// Height marker for coins created by other mempool transactions.
const MEMPOOL_HEIGHT: u32 = u32::MAX;

/// Read access to chain state needed by admission.
pub trait ChainView {
    fn height(&mut self) -> u32;
    fn get_coin(&mut self, outpoint: &OutPoint) -> Option<Coin>;
    fn check_final(&mut self, tx: &Transaction, lock_flags: u32) -> bool;
    fn check_locks(&mut self, tx: &Transaction, lock_flags: u32, prev_heights: &[u32]) -> bool;
    fn segwit_active(&mut self) -> bool;
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct MempoolOptions {
    /// Resident byte cap across all entries.
    pub max_bytes: usize,
    /// Entries older than this are expired during trimming.
    pub expiry_secs: u64,
    /// Static relay floor in sat/kvB.
    pub min_relay_rate: u64,
    /// Let high-priority transactions through under the fee floor.
    pub relay_priority: bool,
    /// Budget free relay instead of refusing it outright.
    pub limit_free: bool,
    /// Free-relay budget in kB per ten minutes.
    pub limit_free_relay: u64,
    /// Refuse fees more than 10000x the relay floor.
    pub reject_absurd_fees: bool,
    /// Orphan pool cap.
    pub max_orphans: usize,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        Self {
            max_bytes: 100_000_000,
            expiry_secs: 72 * 60 * 60,
            min_relay_rate: MIN_RELAY_FEE_RATE,
            relay_priority: true,
            limit_free: true,
            limit_free_relay: 15,
            reject_absurd_fees: true,
            max_orphans: MAX_ORPHAN_TXS,
        }
    }
}

/// A resident transaction with its cached admission facts.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub wtxid: Hash256,
    /// Wall-clock arrival.
    pub arrival: u64,
    /// Chain height when admitted.
    pub height: u32,
    pub vsize: usize,
    pub fee: i64,
    /// Confirmed inputs as (value, coin height) for priority aging.
    chain_inputs: Vec<(i64, u32)>,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> u64 {
        rate_for(self.fee, self.vsize)
    }

    /// Coin-age priority as of a prospective block height.
    pub fn priority(&self, at_height: u32) -> f64 {
        if self.vsize == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for (value, height) in &self.chain_inputs {
            let age = at_height.saturating_sub(*height) as f64;
            sum += *value as f64 * age;
        }
        sum / self.vsize as f64
    }
}

/// Outcome of offering a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTxOutcome {
    /// Admitted; also lists orphans promoted as a result.
    Added { txid: Hash256, promoted: Vec<Hash256> },
    /// Parked awaiting the listed parents.
    Orphaned { txid: Hash256, missing: Vec<Hash256> },
}

/// The pool.
pub struct Mempool {
    options: MempoolOptions,
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → spending pool txid.
    spents: HashMap<OutPoint, Hash256>,
    /// Arrival order.
    by_time: BTreeSet<(u64, Hash256)>,
    /// Fee rate ascending.
    by_rate: BTreeSet<(u64, Hash256)>,
    /// HASH160 of an output script → txids paying it.
    by_addr: HashMap<[u8; 20], HashSet<Hash256>>,
    orphans: OrphanPool,
    min_fee: DynamicMinFee,
    free_count: f64,
    free_last: u64,
    total_bytes: usize,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl Mempool {
    pub fn new(options: MempoolOptions) -> Self {
        Self::with_clock(options, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })
    }

    pub fn with_clock(
        options: MempoolOptions,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        let now = clock();
        Self {
            orphans: OrphanPool::new(options.max_orphans),
            min_fee: DynamicMinFee::new(now),
            options,
            entries: HashMap::new(),
            spents: HashMap::new(),
            by_time: BTreeSet::new(),
            by_rate: BTreeSet::new(),
            by_addr: HashMap::new(),
            free_count: 0.0,
            free_last: now,
            total_bytes: 0,
            clock: Box::new(clock),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.orphans.contains(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// The pool tx spending an outpoint, if any.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spents.get(outpoint).copied()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    /// Txids paying a script (keyed by its HASH160).
    pub fn txids_by_addr(&self, addr: &[u8; 20]) -> Vec<Hash256> {
        self.by_addr
            .get(addr)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current effective fee floor in sat/kvB.
    pub fn min_fee_rate(&mut self) -> u64 {
        let now = (self.clock)();
        let usage = self.total_bytes as f64 / self.options.max_bytes as f64;
        self.options.min_relay_rate.max(self.min_fee.rate(now, usage))
    }

    // ------------------------------------------------------------------
    // admission
    // ------------------------------------------------------------------

    /// Offer an unconfirmed transaction to the pool.
    pub fn add_tx(
        &mut self,
        chain: &mut impl ChainView,
        tx: Transaction,
    ) -> Result<AddTxOutcome, MempoolError> {
        self.insert_tx(chain, tx, false)
    }

    fn insert_tx(
        &mut self,
        chain: &mut impl ChainView,
        tx: Transaction,
        returned: bool,
    ) -> Result<AddTxOutcome, MempoolError> {
        let txid = tx.txid();
        let reject = |code: RejectCode, reason: &'static str, score: i32| {
            MempoolError::Verify(VerifyError::new(code, reason, score).with_hash(txid))
        };

        // 1. Sanity.
        if tx.is_coinbase() {
            return Err(reject(RejectCode::Invalid, "coinbase", 100));
        }
        if tx.check_sanity().is_err() {
            return Err(reject(RejectCode::Invalid, "bad-txns", 100));
        }

        // 2. Standardness; premature witness is rejected until activation.
        if tx.has_witness() && !chain.segwit_active() {
            return Err(reject(RejectCode::Nonstandard, "no-witness-yet", 0));
        }
        if let Err(nonstandard) = policy::check_standard(&tx, self.options.min_relay_rate) {
            let code = if nonstandard == policy::Nonstandard::Dust {
                RejectCode::Dust
            } else {
                RejectCode::Nonstandard
            };
            return Err(MempoolError::Verify(
                VerifyError::new(code, nonstandard.reason(), 0).with_hash(txid),
            ));
        }

        // 3. Finality against the current tip.
        if !chain.check_final(&tx, STANDARD_LOCKTIME_FLAGS) {
            return Err(reject(RejectCode::Nonstandard, "non-final", 0));
        }

        // 4. Duplicates: pool, orphan pool, or already confirmed unspent.
        if self.entries.contains_key(&txid) || self.orphans.contains(&txid) {
            return Err(reject(RejectCode::Duplicate, "txn-already-known", -1));
        }
        if chain
            .get_coin(&OutPoint { txid, index: 0 })
            .is_some()
        {
            return Err(reject(RejectCode::Duplicate, "txn-already-confirmed", -1));
        }

        // 5. Conflicts: no replacement, first spender wins.
        for input in tx.inputs() {
            if self.spents.contains_key(&input.outpoint) {
                return Err(reject(RejectCode::Duplicate, "txn-mempool-conflict", 0));
            }
        }

        // 6. Resolve coins from the pool first, then the chain.
        let height = chain.height();
        let mut coins: Vec<Coin> = Vec::with_capacity(tx.inputs().len());
        let mut prev_heights: Vec<u32> = Vec::with_capacity(tx.inputs().len());
        let mut missing: HashSet<Hash256> = HashSet::new();
        for input in tx.inputs() {
            if let Some(parent) = self.entries.get(&input.outpoint.txid) {
                if let Some(output) = parent.tx.outputs().get(input.outpoint.index as usize) {
                    coins.push(Coin {
                        output: output.clone(),
                        height: MEMPOOL_HEIGHT,
                        coinbase: false,
                    });
                    // An unconfirmed parent counts as confirming alongside.
                    prev_heights.push(height + 1);
                    continue;
                }
                missing.insert(input.outpoint.txid);
                continue;
            }
            match chain.get_coin(&input.outpoint) {
                Some(coin) => {
                    if coin.coinbase && !coin.is_mature(height + 1) {
                        return Err(reject(
                            RejectCode::Invalid,
                            "bad-txns-premature-spend-of-coinbase",
                            0,
                        ));
                    }
                    prev_heights.push(coin.height);
                    coins.push(coin);
                }
                None => {
                    missing.insert(input.outpoint.txid);
                }
            }
        }
        if !missing.is_empty() {
            if returned {
                // Reinserted disconnect txs never orphan; drop quietly.
                return Err(reject(RejectCode::Invalid, "missing-inputs", 0));
            }
            if tx.weight() > kestrel_core::constants::MAX_BLOCK_WEIGHT / 10 {
                return Err(reject(RejectCode::Nonstandard, "orphan-too-large", 10));
            }
            let missing: Vec<Hash256> = missing.into_iter().collect();
            self.orphans.insert(tx, missing.iter().copied().collect());
            debug!(%txid, "transaction parked as orphan");
            return Ok(AddTxOutcome::Orphaned { txid, missing });
        }

        // Relative locks.
        if !chain.check_locks(&tx, STANDARD_LOCKTIME_FLAGS, &prev_heights) {
            return Err(reject(RejectCode::Nonstandard, "non-BIP68-final", 0));
        }

        // Value conservation before the fee gate.
        let input_value: i64 = coins.iter().map(|coin| coin.output.value).sum();
        let output_value = tx
            .output_value()
            .ok_or_else(|| reject(RejectCode::Invalid, "bad-txns-txouttotal-toolarge", 100))?;
        if input_value < output_value {
            return Err(reject(RejectCode::Invalid, "bad-txns-in-belowout", 100));
        }
        let fee = input_value - output_value;
        let vsize = tx.vsize();

        let chain_inputs: Vec<(i64, u32)> = coins
            .iter()
            .filter(|coin| coin.height != MEMPOOL_HEIGHT)
            .map(|coin| (coin.output.value, coin.height))
            .collect();

        // 7. Fee gate.
        if !returned {
            self.check_fee(&tx, txid, fee, vsize, height, &chain_inputs)?;
        }

        // 8. Ancestor bound.
        if self.count_ancestors(&tx) > ANCESTOR_LIMIT {
            return Err(reject(RejectCode::Nonstandard, "too-long-mempool-chain", 0));
        }

        // 9. Script verification: standard first, mandatory to classify.
        for (index, input) in tx.inputs().iter().enumerate() {
            let coin = &coins[index];
            let standard = interpreter::verify(
                &input.script_sig,
                &input.witness,
                &coin.output.script_pubkey,
                &tx,
                index,
                STANDARD_VERIFY_FLAGS,
                coin.output.value,
            );
            if let Err(script_err) = standard {
                let mandatory = interpreter::verify(
                    &input.script_sig,
                    &input.witness,
                    &coin.output.script_pubkey,
                    &tx,
                    index,
                    MANDATORY_VERIFY_FLAGS,
                    coin.output.value,
                );
                return Err(if mandatory.is_ok() {
                    trace!(%txid, input = index, error = %script_err, "nonstandard script input");
                    reject(RejectCode::Nonstandard, "non-mandatory-script-verify-flag", 0)
                } else {
                    reject(RejectCode::Invalid, "mandatory-script-verify-flag-failed", 100)
                });
            }
        }

        // 10. Insert and index. A newcomer that could not displace the
        // cheapest resident is refused outright, without mutation.
        if !returned && self.total_bytes + vsize > self.options.max_bytes {
            if let Some((lowest_rate, _)) = self.by_rate.iter().next() {
                if *lowest_rate >= rate_for(fee, vsize) {
                    return Err(MempoolError::Full);
                }
            }
        }
        let now = (self.clock)();
        let entry = MempoolEntry {
            wtxid: tx.wtxid(),
            txid,
            arrival: now,
            height,
            vsize,
            fee,
            chain_inputs,
            tx,
        };
        self.index_entry(entry);
        info!(%txid, fee, vsize, pool = self.entries.len(), "transaction admitted");

        // Promote orphans now satisfied, transitively.
        let promoted = self.promote_orphans(chain, txid);

        // 11. Enforce the byte cap.
        self.limit_size();

        Ok(AddTxOutcome::Added { txid, promoted })
    }

    fn check_fee(
        &mut self,
        tx: &Transaction,
        txid: Hash256,
        fee: i64,
        vsize: usize,
        height: u32,
        chain_inputs: &[(i64, u32)],
    ) -> Result<(), MempoolError> {
        let now = (self.clock)();
        let usage = self.total_bytes as f64 / self.options.max_bytes as f64;
        let dynamic_rate = self.min_fee.rate(now, usage);
        let relay_required = fee_for(self.options.min_relay_rate, vsize);

        if fee < relay_required {
            // Below the static relay floor: priority plus a decaying budget.
            if self.options.relay_priority {
                let probe = MempoolEntry {
                    tx: tx.clone(),
                    txid,
                    wtxid: txid,
                    arrival: now,
                    height,
                    vsize,
                    fee,
                    chain_inputs: chain_inputs.to_vec(),
                };
                if probe.priority(height + 1) <= FREE_THRESHOLD {
                    return Err(MempoolError::Verify(
                        VerifyError::new(RejectCode::InsufficientFee, "insufficient-priority", 0)
                            .with_hash(txid),
                    ));
                }
            }
            if self.options.limit_free {
                // Exponentially decaying ten-minute budget.
                let elapsed = now.saturating_sub(self.free_last) as f64;
                self.free_count *= (1.0 - 1.0 / 600.0f64).powf(elapsed);
                self.free_last = now;
                if self.free_count + vsize as f64
                    > (self.options.limit_free_relay * 10 * 1000) as f64
                {
                    return Err(MempoolError::Verify(
                        VerifyError::new(RejectCode::InsufficientFee, "insufficient-fee", 0)
                            .with_hash(txid),
                    ));
                }
                self.free_count += vsize as f64;
            } else {
                return Err(MempoolError::Verify(
                    VerifyError::new(RejectCode::InsufficientFee, "insufficient-fee", 0)
                        .with_hash(txid),
                ));
            }
        } else if dynamic_rate > 0 && fee < fee_for(dynamic_rate, vsize) {
            // The adaptive floor is a hard gate with no free path.
            return Err(MempoolError::Verify(
                VerifyError::new(RejectCode::InsufficientFee, "mempool-min-fee-not-met", 0)
                    .with_hash(txid),
            ));
        }

        if self.options.reject_absurd_fees {
            let absurd = fee_for(self.options.min_relay_rate, vsize).saturating_mul(10_000);
            if absurd > 0 && fee > absurd {
                return Err(MempoolError::Verify(
                    VerifyError::new(RejectCode::InsufficientFee, "absurdly-high-fee", -1)
                        .with_hash(txid),
                ));
            }
        }
        Ok(())
    }

    fn index_entry(&mut self, entry: MempoolEntry) {
        let txid = entry.txid;
        for input in entry.tx.inputs() {
            self.spents.insert(input.outpoint, txid);
        }
        for output in entry.tx.outputs() {
            if !output.script_pubkey.is_empty() {
                self.by_addr
                    .entry(hash160(&output.script_pubkey))
                    .or_default()
                    .insert(txid);
            }
        }
        self.by_time.insert((entry.arrival, txid));
        self.by_rate.insert((entry.fee_rate(), txid));
        self.total_bytes += entry.vsize;
        self.entries.insert(txid, entry);
    }

    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in entry.tx.inputs() {
            self.spents.remove(&input.outpoint);
        }
        for output in entry.tx.outputs() {
            if !output.script_pubkey.is_empty() {
                let key = hash160(&output.script_pubkey);
                if let Some(set) = self.by_addr.get_mut(&key) {
                    set.remove(txid);
                    if set.is_empty() {
                        self.by_addr.remove(&key);
                    }
                }
            }
        }
        self.by_time.remove(&(entry.arrival, *txid));
        self.by_rate.remove(&(entry.fee_rate(), *txid));
        self.total_bytes -= entry.vsize;
        Some(entry)
    }

    /// Remove an entry and every pool descendant spending its outputs.
    fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            let Some(entry) = self.remove_entry(&current) else {
                continue;
            };
            for index in 0..entry.tx.outputs().len() as u32 {
                let outpoint = OutPoint { txid: current, index };
                if let Some(spender) = self.spents.get(&outpoint) {
                    queue.push_back(*spender);
                }
            }
            self.orphans.remove_descendants(&current);
            removed.push(entry);
        }
        removed
    }

    fn count_ancestors(&self, tx: &Transaction) -> usize {
        let mut seen: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = tx
            .inputs()
            .iter()
            .map(|input| input.outpoint.txid)
            .collect();
        while let Some(parent) = queue.pop_front() {
            let Some(entry) = self.entries.get(&parent) else {
                continue;
            };
            if !seen.insert(parent) {
                continue;
            }
            if seen.len() > ANCESTOR_LIMIT {
                break;
            }
            for input in entry.tx.inputs() {
                queue.push_back(input.outpoint.txid);
            }
        }
        seen.len()
    }

    fn promote_orphans(
        &mut self,
        chain: &mut impl ChainView,
        parent: Hash256,
    ) -> Vec<Hash256> {
        let mut promoted = Vec::new();
        let mut parents = VecDeque::from([parent]);
        while let Some(parent) = parents.pop_front() {
            for orphan in self.orphans.resolve(&parent) {
                let orphan_txid = orphan.txid();
                match self.insert_tx(chain, orphan, false) {
                    Ok(AddTxOutcome::Added { txid, .. }) => {
                        debug!(%txid, "orphan promoted");
                        promoted.push(txid);
                        parents.push_back(txid);
                    }
                    Ok(AddTxOutcome::Orphaned { .. }) => {}
                    Err(err) => {
                        trace!(txid = %orphan_txid, %err, "orphan rejected on promotion");
                        self.orphans.remove_descendants(&orphan_txid);
                    }
                }
            }
        }
        promoted
    }

    /// Trim to the byte cap: expire stale entries, then shed the cheapest
    /// packages, raising the dynamic floor past what was shed.
    fn limit_size(&mut self) {
        if self.total_bytes <= self.options.max_bytes {
            return;
        }
        let now = (self.clock)();

        // Rolling expiry first.
        let cutoff = now.saturating_sub(self.options.expiry_secs);
        let expired: Vec<Hash256> = self
            .by_time
            .iter()
            .take_while(|(arrival, _)| *arrival < cutoff)
            .map(|(_, txid)| *txid)
            .collect();
        for txid in expired {
            debug!(%txid, "expiring stale mempool entry");
            self.remove_with_descendants(&txid);
        }

        // Then lowest fee rate until under the cap.
        let mut max_evicted_rate = 0;
        while self.total_bytes > self.options.max_bytes {
            let Some((rate, txid)) = self.by_rate.iter().next().copied() else {
                break;
            };
            max_evicted_rate = max_evicted_rate.max(rate);
            debug!(%txid, rate, "evicting lowest-fee-rate package");
            self.remove_with_descendants(&txid);
        }
        if max_evicted_rate > 0 {
            self.min_fee.bump(max_evicted_rate, now);
            info!(floor = max_evicted_rate, "mempool pressure raised dynamic fee floor");
        }
    }

    // ------------------------------------------------------------------
    // block transitions
    // ------------------------------------------------------------------

    /// A block was connected: drop its transactions and anything now in
    /// conflict. Returns the confirmed txids that were resident.
    pub fn remove_block(&mut self, block: &Block) -> Vec<Hash256> {
        let mut confirmed = Vec::new();
        for tx in block.txs.iter().rev() {
            let txid = tx.txid();
            if self.remove_entry(&txid).is_some() {
                confirmed.push(txid);
            }
            // Double-spends of the block's inputs are dead.
            for input in tx.inputs() {
                if let Some(conflict) = self.spents.get(&input.outpoint).copied() {
                    debug!(%conflict, "removing double-spend confirmed away");
                    self.remove_with_descendants(&conflict);
                }
            }
            // Orphans waiting on a now-confirmed parent lose that wait.
            let _ = self.orphans.resolve(&txid);
        }
        self.min_fee.on_block();
        confirmed
    }

    /// A block was disconnected: reinsert its transactions. Policy re-runs
    /// (finality and standardness as if fresh) but the fee gate is skipped.
    pub fn add_reorg_txs(
        &mut self,
        chain: &mut impl ChainView,
        block: &Block,
    ) -> Vec<Hash256> {
        let mut reinserted = Vec::new();
        for tx in block.txs.iter().skip(1) {
            let txid = tx.txid();
            match self.insert_tx(chain, tx.clone(), true) {
                Ok(AddTxOutcome::Added { .. }) => reinserted.push(txid),
                Ok(AddTxOutcome::Orphaned { .. }) => {}
                Err(err) => {
                    trace!(%txid, %err, "disconnect reinsertion refused");
                }
            }
        }
        reinserted
    }

    /// Fee-rate-descending selection for a block template, bounded by total
    /// virtual size.
    pub fn select(&self, max_vsize: usize) -> Vec<&MempoolEntry> {
        let mut selected = Vec::new();
        let mut remaining = max_vsize;
        let mut included: HashSet<Hash256> = HashSet::new();
        // Children can outrank their parents; repeat passes until nothing
        // more fits so dependencies unlock in later rounds.
        loop {
            let mut progressed = false;
            for (_, txid) in self.by_rate.iter().rev() {
                if included.contains(txid) {
                    continue;
                }
                let Some(entry) = self.entries.get(txid) else { continue };
                if entry.vsize > remaining {
                    continue;
                }
                let parents_ready = entry.tx.inputs().iter().all(|input| {
                    !self.entries.contains_key(&input.outpoint.txid)
                        || included.contains(&input.outpoint.txid)
                });
                if !parents_ready {
                    continue;
                }
                included.insert(*txid);
                remaining -= entry.vsize;
                selected.push(entry);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        selected
    }
}
