//! Orphan transactions: received before their parents.
//!
//! Parent-child relations are kept as an index map from missing parent txid
//! to waiting children plus a flat store of the orphans themselves. The pool
//! is hard-capped; overflow evicts a random resident.

use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;
use tracing::debug;

use kestrel_core::hash::Hash256;
use kestrel_core::tx::Transaction;

/// An orphan and the parents it still waits for.
#[derive(Debug, Clone)]
pub struct OrphanTx {
    pub tx: Transaction,
    pub missing: HashSet<Hash256>,
}

/// Capped pool of parentless transactions.
pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanTx>,
    /// Missing parent txid → txids of waiting orphans.
    waiting: HashMap<Hash256, HashSet<Hash256>>,
    max: usize,
}

impl OrphanPool {
    pub fn new(max: usize) -> Self {
        Self { orphans: HashMap::new(), waiting: HashMap::new(), max }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    /// Park an orphan waiting on `missing` parents.
    ///
    /// Returns the number of randomly evicted residents (zero or one).
    pub fn insert(&mut self, tx: Transaction, missing: HashSet<Hash256>) -> usize {
        debug_assert!(!missing.is_empty());
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return 0;
        }

        let mut evicted = 0;
        if self.orphans.len() >= self.max {
            self.evict_random();
            evicted = 1;
        }

        for parent in &missing {
            self.waiting.entry(*parent).or_default().insert(txid);
        }
        debug!(%txid, missing = missing.len(), "parked orphan transaction");
        self.orphans.insert(txid, OrphanTx { tx, missing });
        evicted
    }

    fn evict_random(&mut self) {
        let victim = self
            .orphans
            .keys()
            .copied()
            .choose(&mut rand::thread_rng());
        if let Some(victim) = victim {
            debug!(txid = %victim, "orphan pool full, evicting at random");
            self.remove(&victim);
        }
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<OrphanTx> {
        let orphan = self.orphans.remove(txid)?;
        for parent in &orphan.missing {
            if let Some(children) = self.waiting.get_mut(parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.waiting.remove(parent);
                }
            }
        }
        Some(orphan)
    }

    /// A parent became available: orphans that no longer wait on anything
    /// are removed from the pool and returned for re-admission.
    pub fn resolve(&mut self, parent: &Hash256) -> Vec<Transaction> {
        let Some(children) = self.waiting.remove(parent) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for child in children {
            let Some(orphan) = self.orphans.get_mut(&child) else {
                continue;
            };
            orphan.missing.remove(parent);
            if orphan.missing.is_empty() {
                let orphan = self.orphans.remove(&child).expect("present");
                ready.push(orphan.tx);
            }
        }
        ready
    }

    /// Drop orphans that depend on a given parent (a rejected ancestor).
    pub fn remove_descendants(&mut self, parent: &Hash256) -> usize {
        let Some(children) = self.waiting.remove(parent) else {
            return 0;
        };
        let mut removed = 0;
        for child in children {
            if self.remove(&child).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.orphans.keys().copied().collect()
    }
}
