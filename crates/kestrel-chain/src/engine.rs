//! The chain engine: sole writer to the chain store.
//!
//! Drives connect, disconnect, and reorganization; enforces contextual
//! consensus rules; parks blocks with unknown parents in an orphan pool and
//! resolves them when their ancestry arrives. Events for one block are
//! emitted in a fixed order: disconnects (tip first), connects, the new tip,
//! then progress.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use kestrel_core::block::{Block, BlockSanityError, UndoRecord};
use kestrel_core::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SIGOPS_COST, MAX_FUTURE_BLOCK_TIME, WITNESS_SCALE_FACTOR,
};
use kestrel_core::error::{RejectCode, VerifyError};
use kestrel_core::hash::Hash256;
use kestrel_core::locks::{
    self, LOCKTIME_MEDIAN_TIME_PAST, LOCKTIME_VERIFY_SEQUENCE,
};
use kestrel_core::merkle;
use kestrel_core::pow::check_proof_of_work;
use kestrel_core::script::{
    self, interpreter, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG,
    VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_WITNESS,
};
use kestrel_core::tx::{Coin, OutPoint, Transaction};

use crate::difficulty;
use crate::entry::{ChainEntry, EntryState};
use crate::error::{ChainError, StoreError};
use crate::kv::KvStore;
use crate::store::ChainDB;
use crate::versionbits::{HeaderView, VersionBits};

/// Maximum blocks parked while their ancestry is missing.
const MAX_BLOCK_ORPHANS: usize = 64;

/// BIP16 switchover time; P2SH evaluation applies from here on.
const P2SH_ACTIVATION_TIME: u32 = 1_333_238_400;

/// Result of offering a block to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Extended (or reorganized onto) the main chain.
    Connected,
    /// Parked until its parent arrives.
    Orphaned,
    /// Already stored or parked.
    AlreadyKnown,
    /// Stored on a side branch with insufficient work.
    SideBranch,
}

/// Chain lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block left the main chain during a reorg.
    Disconnect { hash: Hash256, height: u32 },
    /// A block joined the main chain.
    Connect { hash: Hash256, height: u32 },
    /// The tip moved.
    Tip { hash: Hash256, height: u32 },
    /// Sync progress marker, emitted after the tip event.
    Progress { height: u32, time: u32 },
    /// A competitive side branch appeared.
    Fork { hash: Hash256, height: u32 },
    /// A block failed consensus.
    Invalid { hash: Hash256, score: i32 },
    /// A block was parked awaiting its parent.
    Orphan { hash: Hash256 },
    /// A block was offered twice.
    Exists { hash: Hash256 },
}

/// Receiver interface for chain events.
pub trait ChainListener: Send + Sync {
    fn on_event(&self, event: &ChainEvent);
}

/// The consensus engine over a chain store.
pub struct Chain<K: KvStore> {
    db: ChainDB<K>,
    orphans: HashMap<Hash256, Block>,
    orphans_by_prev: HashMap<Hash256, Vec<Hash256>>,
    invalid: HashSet<Hash256>,
    versionbits: VersionBits,
    listeners: Vec<Arc<dyn ChainListener>>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

struct DbView<'a, K: KvStore>(&'a mut ChainDB<K>);

impl<K: KvStore> HeaderView for DbView<'_, K> {
    fn get_header(&mut self, hash: &Hash256) -> Option<ChainEntry> {
        self.0.get_entry(hash).ok().flatten()
    }
}

impl<K: KvStore> Chain<K> {
    pub fn new(db: ChainDB<K>) -> Self {
        Self::with_clock(db, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })
    }

    /// Inject a clock for tests.
    pub fn with_clock(db: ChainDB<K>, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            db,
            orphans: HashMap::new(),
            orphans_by_prev: HashMap::new(),
            invalid: HashSet::new(),
            versionbits: VersionBits::new(),
            listeners: Vec::new(),
            clock: Box::new(clock),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    fn emit(&self, event: ChainEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    pub fn db(&mut self) -> &mut ChainDB<K> {
        &mut self.db
    }

    pub fn tip(&self) -> ChainEntry {
        self.db.tip().clone()
    }

    pub fn height(&self) -> u32 {
        self.db.height()
    }

    /// Validation state of a block hash.
    pub fn entry_state(&mut self, hash: &Hash256) -> Result<EntryState, StoreError> {
        if self.invalid.contains(hash) {
            return Ok(EntryState::Invalid);
        }
        if self.orphans.contains_key(hash) {
            return Ok(EntryState::Orphan);
        }
        match self.db.get_entry(hash)? {
            Some(entry) => {
                if self.db.is_main_chain(&entry)? {
                    Ok(EntryState::Valid)
                } else {
                    Ok(EntryState::Headers)
                }
            }
            None => Ok(EntryState::Unknown),
        }
    }

    // ------------------------------------------------------------------
    // add
    // ------------------------------------------------------------------

    /// Offer a candidate block to the chain.
    pub fn add(&mut self, block: Block) -> Result<AddOutcome, ChainError> {
        let hash = block.hash();

        if self.invalid.contains(&hash) || self.invalid.contains(&block.header.prev) {
            self.invalid.insert(hash);
            self.emit(ChainEvent::Invalid { hash, score: 100 });
            return Err(VerifyError::new(RejectCode::Duplicate, "duplicate-invalid", 100)
                .with_hash(hash)
                .into());
        }
        if self.db.has_entry(&hash)? || self.orphans.contains_key(&hash) {
            self.emit(ChainEvent::Exists { hash });
            return Ok(AddOutcome::AlreadyKnown);
        }

        self.check_standalone(&block, &hash)?;

        // Unknown parent: park as orphan.
        let Some(parent) = self.db.get_entry(&block.header.prev)? else {
            self.add_orphan(hash, block);
            self.emit(ChainEvent::Orphan { hash });
            return Ok(AddOutcome::Orphaned);
        };

        let outcome = self.add_with_parent(block, hash, parent)?;

        // Anything waiting on this block can now be linked.
        if outcome == AddOutcome::Connected || outcome == AddOutcome::SideBranch {
            self.resolve_orphans(hash)?;
        }
        Ok(outcome)
    }

    fn add_with_parent(
        &mut self,
        block: Block,
        hash: Hash256,
        parent: ChainEntry,
    ) -> Result<AddOutcome, ChainError> {
        if let Err(err) = self.check_contextual_header(&block, &hash, &parent) {
            if let ChainError::Verify(verify) = &err {
                self.mark_invalid(hash, verify.score);
            }
            return Err(err);
        }

        let entry = ChainEntry::link(block.header, &parent);
        let tip = self.db.tip().clone();

        if entry.header.prev == tip.hash() {
            // Forward extension of the main chain.
            if let Err(err) = self.validate_and_connect(&entry, &block) {
                if let ChainError::Verify(verify) = &err {
                    self.mark_invalid(hash, verify.score);
                }
                return Err(err);
            }
            self.emit(ChainEvent::Tip { hash, height: entry.height });
            self.emit(ChainEvent::Progress { height: entry.height, time: entry.header.time });
            return Ok(AddOutcome::Connected);
        }

        // Side branch: store it, reorganize only on strictly greater work.
        self.db.save_entry(&entry, Some(&block))?;
        if entry.chainwork > tip.chainwork {
            info!(
                fork = %hash,
                height = entry.height,
                "side branch exceeds main chain work, reorganizing"
            );
            self.reorganize(&entry)?;
            self.emit(ChainEvent::Tip { hash, height: entry.height });
            self.emit(ChainEvent::Progress { height: entry.height, time: entry.header.time });
            return Ok(AddOutcome::Connected);
        }

        debug!(fork = %hash, height = entry.height, "stored side branch block");
        self.emit(ChainEvent::Fork { hash, height: entry.height });
        Ok(AddOutcome::SideBranch)
    }

    /// Context-free checks: proof of work, clock bound, structure.
    fn check_standalone(&mut self, block: &Block, hash: &Hash256) -> Result<(), ChainError> {
        let pow_limit = self.db.params().pow_limit;
        if !check_proof_of_work(hash, block.header.bits, &pow_limit) {
            self.mark_invalid(*hash, 50);
            return Err(VerifyError::new(RejectCode::Invalid, "high-hash", 50)
                .with_hash(*hash)
                .into());
        }
        let now = (self.clock)();
        if block.header.time as u64 > now + MAX_FUTURE_BLOCK_TIME {
            // Not permanently invalid: it may become acceptable.
            return Err(VerifyError::new(RejectCode::Invalid, "time-too-new", 0)
                .with_hash(*hash)
                .into());
        }
        if let Err(err) = block.check_sanity() {
            self.mark_invalid(*hash, 100);
            let reason = match err {
                BlockSanityError::Empty => "bad-blk-length",
                BlockSanityError::OverWeight(_) => "bad-blk-weight",
                BlockSanityError::FirstNotCoinbase => "bad-cb-missing",
                BlockSanityError::ExtraCoinbase => "bad-cb-multiple",
                BlockSanityError::MutatedMerkle => "bad-txns-duplicate",
                BlockSanityError::BadMerkleRoot => "bad-txnmrklroot",
            };
            return Err(VerifyError::new(RejectCode::Invalid, reason, 100)
                .with_hash(*hash)
                .into());
        }
        for tx in &block.txs {
            if let Err(tx_err) = tx.check_sanity() {
                self.mark_invalid(*hash, 100);
                warn!(%hash, error = %tx_err, "block contains insane transaction");
                return Err(VerifyError::new(RejectCode::Invalid, "bad-txns", 100)
                    .with_hash(*hash)
                    .into());
            }
        }
        Ok(())
    }

    /// Header rules that need the parent: retarget bits, median time,
    /// version obsolescence, checkpoints.
    fn check_contextual_header(
        &mut self,
        block: &Block,
        hash: &Hash256,
        parent: &ChainEntry,
    ) -> Result<(), ChainError> {
        let height = parent.height + 1;

        let expected_bits = self.required_bits(parent, block.header.time)?;
        if block.header.bits != expected_bits {
            return Err(VerifyError::new(RejectCode::Invalid, "bad-diffbits", 100)
                .with_hash(*hash)
                .with_height(height)
                .into());
        }

        let mtp = self.median_time_past(parent)?;
        if (block.header.time as u64) <= mtp {
            return Err(VerifyError::new(RejectCode::Invalid, "time-too-old", 100)
                .with_hash(*hash)
                .with_height(height)
                .into());
        }

        // Obsolete versions after their successor rules buried.
        let params = self.db.params();
        let min_version = if height >= params.bip65_height {
            4
        } else if height >= params.bip66_height {
            3
        } else if height >= params.bip34_height {
            2
        } else {
            1
        };
        if block.header.version < min_version {
            return Err(VerifyError::new(RejectCode::Obsolete, "bad-version", 100)
                .with_hash(*hash)
                .with_height(height)
                .into());
        }

        // A block contradicting a compiled-in checkpoint is rejected hard.
        if let Some(expected) = self.db.params().checkpoint_at(height) {
            if expected != *hash {
                return Err(VerifyError::new(RejectCode::Checkpoint, "checkpoint-mismatch", 100)
                    .with_hash(*hash)
                    .with_height(height)
                    .into());
            }
        }
        // No forks below the last checkpoint.
        if height <= self.db.params().last_checkpoint_height()
            && !self.db.is_main_chain(parent)?
        {
            return Err(VerifyError::new(RejectCode::Checkpoint, "bad-fork-prior-to-checkpoint", 100)
                .with_hash(*hash)
                .with_height(height)
                .into());
        }
        Ok(())
    }

    /// Expected compact bits for a block after `parent` at `block_time`.
    pub fn required_bits(
        &mut self,
        parent: &ChainEntry,
        block_time: u32,
    ) -> Result<u32, StoreError> {
        let params = self.db.params().clone();
        if params.no_retarget {
            return Ok(parent.header.bits);
        }
        let next_height = parent.height + 1;
        if !difficulty::is_retarget_height(&params, next_height) {
            if params.allow_min_difficulty {
                // A 20-minute gap earns a min-difficulty block.
                if block_time > parent.header.time + 2 * params.target_spacing {
                    return Ok(params.pow_limit_bits);
                }
                // Otherwise inherit the last real difficulty in the window.
                let mut entry = parent.clone();
                while entry.height % params.retarget_interval != 0
                    && entry.header.bits == params.pow_limit_bits
                {
                    match self.db.get_entry(&entry.header.prev)? {
                        Some(prev) => entry = prev,
                        None => break,
                    }
                }
                return Ok(entry.header.bits);
            }
            return Ok(parent.header.bits);
        }

        let first_height = next_height - params.retarget_interval;
        let first = self
            .db
            .get_ancestor(parent, first_height)?
            .ok_or_else(|| StoreError::Missing(format!("retarget ancestor {first_height}")))?;
        Ok(difficulty::retarget(
            &params,
            parent.header.bits,
            first.header.time,
            parent.header.time,
        ))
    }

    /// Median of the last eleven timestamps ending at `entry`.
    pub fn median_time_past(&mut self, entry: &ChainEntry) -> Result<u64, StoreError> {
        let mut times = Vec::with_capacity(kestrel_core::constants::MEDIAN_TIME_SPAN);
        let mut current = entry.clone();
        loop {
            times.push(current.header.time);
            if times.len() == kestrel_core::constants::MEDIAN_TIME_SPAN || current.height == 0 {
                break;
            }
            match self.db.get_entry(&current.header.prev)? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(difficulty::median_time(&times))
    }

    // ------------------------------------------------------------------
    // connect / reorg
    // ------------------------------------------------------------------

    /// Script verification flags active for a block at `height`.
    fn script_flags(&mut self, height: u32, block_time: u32) -> u32 {
        let params = self.db.params();
        let mut flags = 0;
        if block_time >= P2SH_ACTIVATION_TIME {
            flags |= VERIFY_P2SH;
        }
        if height >= params.bip66_height {
            flags |= VERIFY_DERSIG;
        }
        if height >= params.bip65_height {
            flags |= VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if height >= params.csv_height {
            flags |= VERIFY_CHECKSEQUENCEVERIFY;
        }
        if height >= params.segwit_height {
            flags |= VERIFY_WITNESS | VERIFY_NULLDUMMY;
        }
        flags
    }

    fn segwit_active(&mut self, height: u32) -> bool {
        height >= self.db.params().segwit_height
    }

    /// Whether segwit rules apply to the next block.
    pub fn is_segwit_active(&mut self) -> bool {
        let next = self.db.height() + 1;
        self.segwit_active(next)
    }

    fn csv_active(&mut self, height: u32) -> bool {
        height >= self.db.params().csv_height
    }

    /// Full contextual validation, then an atomic store connect.
    fn validate_and_connect(
        &mut self,
        entry: &ChainEntry,
        block: &Block,
    ) -> Result<(), ChainError> {
        let undo = self.validate_block(entry, block)?;
        self.db.connect(entry, block, &undo)?;
        self.emit(ChainEvent::Connect { hash: entry.hash(), height: entry.height });
        Ok(())
    }

    fn validate_block(
        &mut self,
        entry: &ChainEntry,
        block: &Block,
    ) -> Result<UndoRecord, ChainError> {
        let hash = entry.hash();
        let height = entry.height;
        let reject = |reason: &'static str, score: i32| {
            ChainError::Verify(
                VerifyError::new(RejectCode::Invalid, reason, score)
                    .with_hash(hash)
                    .with_height(height),
            )
        };

        let flags = self.script_flags(height, block.header.time);
        let segwit = self.segwit_active(height);
        let csv = self.csv_active(height);

        // Witness commitment (BIP141).
        if segwit && block.has_witness() {
            let coinbase = block.coinbase().expect("sanity checked");
            let commitment = merkle::find_witness_commitment(coinbase)
                .ok_or_else(|| reject("bad-witness-merkle-match", 100))?;
            let nonce: [u8; 32] = coinbase
                .inputs()
                .first()
                .and_then(|input| input.witness.first())
                .and_then(|item| item.as_slice().try_into().ok())
                .ok_or_else(|| reject("bad-witness-nonce-size", 100))?;
            let witness_root = merkle::witness_merkle_root(&block.txs);
            if merkle::witness_commitment(&witness_root, &nonce) != commitment {
                return Err(reject("bad-witness-merkle-match", 100));
            }
        } else if !segwit && block.has_witness() {
            return Err(reject("unexpected-witness", 100));
        }

        // BIP34: the coinbase commits to its height.
        if height >= self.db.params().bip34_height {
            let mut expected = Vec::new();
            script::push_num(&mut expected, height as i64);
            let coinbase = block.coinbase().expect("sanity checked");
            if !coinbase.inputs()[0].script_sig.starts_with(&expected) {
                return Err(reject("bad-cb-height", 100));
            }
        }

        // BIP30: no overwriting an existing unspent txid.
        let params = self.db.params().clone();
        if !params.is_bip30_exception(height, &hash) {
            for tx in &block.txs {
                let txid = tx.txid();
                for index in 0..tx.outputs().len() as u32 {
                    if self.db.has_coin(&OutPoint { txid, index })? {
                        return Err(reject("bad-txns-BIP30", 100));
                    }
                }
            }
        }

        // Finality cutoff: median-time-past once CSV is active (BIP113).
        let parent = self
            .db
            .get_entry(&block.header.prev)?
            .ok_or_else(|| StoreError::Missing("parent during connect".into()))?;
        let time_cutoff = if csv {
            self.median_time_past(&parent)?
        } else {
            block.header.time as u64
        };

        // Per-tx input checks, script verification, fee and sigop totals.
        let mut undo = UndoRecord::new();
        let mut created: HashMap<OutPoint, Coin> = HashMap::new();
        let mut fees: i64 = 0;
        let mut sigops_cost: usize = 0;

        for tx in &block.txs {
            if !locks::is_final(tx, height, time_cutoff) {
                return Err(reject("bad-txns-nonfinal", 10));
            }

            let txid = tx.txid();
            if tx.is_coinbase() {
                sigops_cost += legacy_sigops(tx) * WITNESS_SCALE_FACTOR;
                for (index, output) in tx.outputs().iter().enumerate() {
                    created.insert(
                        OutPoint { txid, index: index as u32 },
                        Coin { output: output.clone(), height, coinbase: true },
                    );
                }
                continue;
            }

            // Resolve every input against the store plus in-block outputs.
            let mut spent: Vec<(OutPoint, Coin)> = Vec::with_capacity(tx.inputs().len());
            let mut input_value: i64 = 0;
            let mut prev_heights: Vec<u32> = Vec::with_capacity(tx.inputs().len());
            for input in tx.inputs() {
                let coin = match created.remove(&input.outpoint) {
                    Some(coin) => coin,
                    None => self
                        .db
                        .get_coin(&input.outpoint)?
                        .ok_or_else(|| reject("bad-txns-inputs-missingorspent", 100))?,
                };
                if coin.coinbase && height.saturating_sub(coin.height) < COINBASE_MATURITY {
                    return Err(reject("bad-txns-premature-spend-of-coinbase", 100));
                }
                input_value = input_value
                    .checked_add(coin.output.value)
                    .ok_or_else(|| reject("bad-txns-inputvalues-outofrange", 100))?;
                prev_heights.push(coin.height);
                spent.push((input.outpoint, coin));
            }

            // BIP68 relative locks.
            if csv {
                let lock_flags = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;
                let lock = self.sequence_locks(tx, lock_flags, &prev_heights)?;
                let mtp = self.median_time_past(&parent)?;
                if !locks::evaluate_sequence_locks(lock, height, mtp) {
                    return Err(reject("bad-txns-nonfinal", 10));
                }
            }

            let output_value = tx.output_value().ok_or_else(|| reject("bad-txns-txouttotal-toolarge", 100))?;
            if input_value < output_value {
                return Err(reject("bad-txns-in-belowout", 100));
            }
            fees = fees
                .checked_add(input_value - output_value)
                .ok_or_else(|| reject("bad-txns-fee-outofrange", 100))?;

            sigops_cost += sigop_cost(tx, &spent, flags);
            if sigops_cost > MAX_BLOCK_SIGOPS_COST {
                return Err(reject("bad-blk-sigops", 100));
            }

            // Script verification over every input.
            for (index, input) in tx.inputs().iter().enumerate() {
                let coin = &spent[index].1;
                interpreter::verify(
                    &input.script_sig,
                    &input.witness,
                    &coin.output.script_pubkey,
                    tx,
                    index,
                    flags,
                    coin.output.value,
                )
                .map_err(|script_err| {
                    debug!(%txid, input = index, error = %script_err, "script verification failed");
                    reject("mandatory-script-verify-flag-failed", 100)
                })?;
            }

            for (outpoint, coin) in spent {
                undo.push(outpoint, coin);
            }
            for (index, output) in tx.outputs().iter().enumerate() {
                created.insert(
                    OutPoint { txid, index: index as u32 },
                    Coin { output: output.clone(), height, coinbase: false },
                );
            }
        }

        // Subsidy ceiling.
        let coinbase_value = block
            .coinbase()
            .and_then(|cb| cb.output_value())
            .ok_or_else(|| reject("bad-cb-amount", 100))?;
        let allowed = params
            .subsidy(height)
            .checked_add(fees)
            .ok_or_else(|| reject("bad-cb-amount", 100))?;
        if coinbase_value > allowed {
            return Err(reject("bad-cb-amount", 100));
        }

        Ok(undo)
    }

    fn sequence_locks(
        &mut self,
        tx: &Transaction,
        lock_flags: u32,
        prev_heights: &[u32],
    ) -> Result<locks::LockPoints, StoreError> {
        // Pre-resolve the median times the closure needs.
        let mut medians: HashMap<u32, u64> = HashMap::new();
        for &height in prev_heights {
            let base = height.saturating_sub(1);
            if let std::collections::hash_map::Entry::Vacant(slot) = medians.entry(base) {
                let mtp = match self.db.get_entry_by_height(base)? {
                    Some(entry) => self.median_time_past(&entry)?,
                    None => 0,
                };
                slot.insert(mtp);
            }
        }
        Ok(locks::calculate_sequence_locks(tx, lock_flags, prev_heights, |height| {
            medians.get(&height).copied().unwrap_or(0)
        }))
    }

    /// Switch the main chain to the branch ending at `target`.
    fn reorganize(&mut self, target: &ChainEntry) -> Result<(), ChainError> {
        let tip = self.db.tip().clone();
        let ancestor = self.common_ancestor(&tip, target)?;

        // Unwind to the fork point, remembering what we removed.
        let mut disconnected: Vec<Block> = Vec::new();
        while self.db.tip().hash() != ancestor.hash() {
            let old_tip = self.db.tip().clone();
            let block = self.db.disconnect()?;
            self.emit(ChainEvent::Disconnect { hash: old_tip.hash(), height: old_tip.height });
            disconnected.push(block);
        }

        // Collect the new branch, ancestor-exclusive, in connect order.
        let mut branch: Vec<ChainEntry> = Vec::new();
        let mut cursor = target.clone();
        while cursor.hash() != ancestor.hash() {
            branch.push(cursor.clone());
            cursor = self
                .db
                .get_entry(&cursor.header.prev)?
                .ok_or_else(|| StoreError::Missing("reorg branch parent".into()))?;
        }
        branch.reverse();

        let mut connected: usize = 0;
        for entry in &branch {
            let hash = entry.hash();
            let block = self
                .db
                .get_block(&hash)?
                .ok_or_else(|| StoreError::Missing(format!("reorg block {hash}")))?;
            match self.validate_and_connect(entry, &block) {
                Ok(()) => connected += 1,
                Err(err) => {
                    // The new branch is bad: mark it and restore the old
                    // chain before surfacing the failure.
                    if let ChainError::Verify(verify) = &err {
                        self.mark_invalid(hash, verify.score);
                    }
                    warn!(%hash, "reorg branch failed validation, restoring previous chain");
                    self.restore_chain(connected, &ancestor, &disconnected)?;
                    return Err(err);
                }
            }
        }
        info!(
            from = tip.height,
            to = target.height,
            fork = ancestor.height,
            "chain reorganized"
        );
        Ok(())
    }

    /// Undo a partial reorg and reconnect the previously valid chain.
    fn restore_chain(
        &mut self,
        connected: usize,
        ancestor: &ChainEntry,
        disconnected: &[Block],
    ) -> Result<(), ChainError> {
        for _ in 0..connected {
            let old_tip = self.db.tip().clone();
            self.db.disconnect()?;
            self.emit(ChainEvent::Disconnect { hash: old_tip.hash(), height: old_tip.height });
        }
        debug_assert_eq!(self.db.tip().hash(), ancestor.hash());
        // Reconnect in original order (disconnected is tip-first).
        for block in disconnected.iter().rev() {
            let parent = self.db.tip().clone();
            let entry = ChainEntry::link(block.header, &parent);
            self.validate_and_connect(&entry, block)?;
        }
        Ok(())
    }

    fn common_ancestor(
        &mut self,
        a: &ChainEntry,
        b: &ChainEntry,
    ) -> Result<ChainEntry, ChainError> {
        let mut left = a.clone();
        let mut right = b.clone();
        while left.height > right.height {
            left = self
                .db
                .get_entry(&left.header.prev)?
                .ok_or_else(|| StoreError::Missing("ancestor walk".into()))?;
        }
        while right.height > left.height {
            right = self
                .db
                .get_entry(&right.header.prev)?
                .ok_or_else(|| StoreError::Missing("ancestor walk".into()))?;
        }
        while left.hash() != right.hash() {
            left = self
                .db
                .get_entry(&left.header.prev)?
                .ok_or_else(|| StoreError::Missing("ancestor walk".into()))?;
            right = self
                .db
                .get_entry(&right.header.prev)?
                .ok_or_else(|| StoreError::Missing("ancestor walk".into()))?;
        }
        Ok(left)
    }

    /// Rewind the main chain to `height`.
    pub fn reset(&mut self, height: u32) -> Result<(), ChainError> {
        while self.db.height() > height {
            let old_tip = self.db.tip().clone();
            self.db.disconnect()?;
            self.emit(ChainEvent::Disconnect { hash: old_tip.hash(), height: old_tip.height });
        }
        let tip = self.db.tip().clone();
        self.emit(ChainEvent::Tip { hash: tip.hash(), height: tip.height });
        Ok(())
    }

    fn mark_invalid(&mut self, hash: Hash256, score: i32) {
        self.invalid.insert(hash);
        self.emit(ChainEvent::Invalid { hash, score });
    }

    // ------------------------------------------------------------------
    // orphans
    // ------------------------------------------------------------------

    fn add_orphan(&mut self, hash: Hash256, block: Block) {
        if self.orphans.len() >= MAX_BLOCK_ORPHANS {
            // Evict an arbitrary parked block to stay bounded.
            if let Some(evict) = self.orphans.keys().next().copied() {
                self.remove_orphan(&evict);
            }
        }
        self.orphans_by_prev
            .entry(block.header.prev)
            .or_default()
            .push(hash);
        self.orphans.insert(hash, block);
        debug!(%hash, parked = self.orphans.len(), "parked orphan block");
    }

    fn remove_orphan(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.orphans.remove(hash)?;
        if let Some(children) = self.orphans_by_prev.get_mut(&block.header.prev) {
            children.retain(|h| h != hash);
            if children.is_empty() {
                self.orphans_by_prev.remove(&block.header.prev);
            }
        }
        Some(block)
    }

    /// Connect any parked blocks whose parent just arrived, transitively.
    fn resolve_orphans(&mut self, parent_hash: Hash256) -> Result<(), ChainError> {
        let mut ready = vec![parent_hash];
        while let Some(parent) = ready.pop() {
            let Some(children) = self.orphans_by_prev.get(&parent).cloned() else {
                continue;
            };
            for child_hash in children {
                let Some(block) = self.remove_orphan(&child_hash) else {
                    continue;
                };
                match self.add(block) {
                    Ok(AddOutcome::Connected) | Ok(AddOutcome::SideBranch) => {
                        ready.push(child_hash);
                    }
                    Ok(_) => {}
                    Err(ChainError::Store(err)) => return Err(err.into()),
                    Err(ChainError::Verify(err)) => {
                        debug!(hash = %child_hash, reason = err.reason, "parked orphan was invalid");
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether a hash is parked in the orphan pool.
    pub fn has_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Deepest missing ancestor of a parked orphan chain: the hash to
    /// request from the network.
    pub fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let mut root = *hash;
        let mut current = *hash;
        while let Some(block) = self.orphans.get(&current) {
            root = block.header.prev;
            current = block.header.prev;
        }
        root
    }

    // ------------------------------------------------------------------
    // locators / queries
    // ------------------------------------------------------------------

    /// Exponentially spaced locator starting at `from` (or the tip).
    pub fn get_locator(&mut self, from: Option<Hash256>) -> Result<Vec<Hash256>, ChainError> {
        let start = match from {
            Some(hash) => match self.db.get_entry(&hash)? {
                Some(entry) => entry,
                None => self.db.tip().clone(),
            },
            None => self.db.tip().clone(),
        };

        let mut hashes = Vec::new();

        // An off-main start contributes its own hash, then the walk follows
        // its nearest main-chain ancestor.
        let anchor = if self.db.is_main_chain(&start)? {
            start
        } else {
            hashes.push(start.hash());
            let mut cursor = start;
            loop {
                match self.db.get_entry(&cursor.header.prev)? {
                    Some(parent) if self.db.is_main_chain(&parent)? => break parent,
                    Some(parent) => cursor = parent,
                    None => break self.db.tip().clone(),
                }
            }
        };

        let mut height = anchor.height as i64;
        let mut step: i64 = 1;
        while height > 0 {
            match self.db.get_hash_by_height(height as u32)? {
                Some(hash) => hashes.push(hash),
                None => break,
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }

        let genesis = self.db.params().genesis_hash();
        if hashes.last() != Some(&genesis) {
            hashes.push(genesis);
        }
        Ok(hashes)
    }

    /// Whether the transaction would be final in the next block.
    pub fn check_final(&mut self, tx: &Transaction, lock_flags: u32) -> Result<bool, ChainError> {
        let tip = self.db.tip().clone();
        let time = if lock_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 {
            self.median_time_past(&tip)?
        } else {
            (self.clock)()
        };
        Ok(locks::is_final(tx, tip.height + 1, time))
    }

    /// Whether the transaction's relative locks would be satisfied in the
    /// next block, given each input coin's height.
    pub fn check_locks(
        &mut self,
        tx: &Transaction,
        lock_flags: u32,
        prev_heights: &[u32],
    ) -> Result<bool, ChainError> {
        let tip = self.db.tip().clone();
        let lock = self.sequence_locks(tx, lock_flags, prev_heights)?;
        let mtp = self.median_time_past(&tip)?;
        Ok(locks::evaluate_sequence_locks(lock, tip.height + 1, mtp))
    }

    /// Deployment state probe, exposed for policy decisions.
    pub fn deployment_state(
        &mut self,
        name: &str,
    ) -> crate::versionbits::ThresholdState {
        let params = self.db.params().clone();
        let parent = self.db.tip().clone();
        let Some(deployment) = params.deployments.iter().find(|d| d.name == name) else {
            return crate::versionbits::ThresholdState::Defined;
        };
        let mut view = DbView(&mut self.db);
        self.versionbits.state(&mut view, &params, deployment, Some(&parent))
    }
}

/// Legacy sigop count over a transaction's own scripts, worst-case multisig.
fn legacy_sigops(tx: &Transaction) -> usize {
    let mut count = 0;
    for input in tx.inputs() {
        count += script::count_sigops(&input.script_sig, false);
    }
    for output in tx.outputs() {
        count += script::count_sigops(&output.script_pubkey, false);
    }
    count
}

/// Witness-scaled sigop cost of a transaction given its spent coins.
pub fn sigop_cost(tx: &Transaction, spent: &[(OutPoint, Coin)], flags: u32) -> usize {
    let mut cost = legacy_sigops(tx) * WITNESS_SCALE_FACTOR;
    for (index, input) in tx.inputs().iter().enumerate() {
        let Some((_, coin)) = spent.get(index) else { continue };
        let prev = &coin.output.script_pubkey;
        if flags & VERIFY_P2SH != 0 && script::is_p2sh(prev) {
            if let Some(redeem) = script::last_push(&input.script_sig) {
                if script::witness_program(&redeem).is_none() {
                    cost += script::count_sigops(&redeem, true) * WITNESS_SCALE_FACTOR;
                } else if flags & VERIFY_WITNESS != 0 {
                    cost += witness_sigops(&redeem, &input.witness);
                }
            }
        } else if flags & VERIFY_WITNESS != 0 && script::witness_program(prev).is_some() {
            cost += witness_sigops(prev, &input.witness);
        }
    }
    cost
}

fn witness_sigops(program_script: &[u8], witness: &kestrel_core::tx::Witness) -> usize {
    match script::witness_program(program_script) {
        Some((0, program)) if program.len() == 20 => 1,
        Some((0, program)) if program.len() == 32 => witness
            .last()
            .map(|witness_script| script::count_sigops(witness_script, true))
            .unwrap_or(0),
        _ => 0,
    }
}
