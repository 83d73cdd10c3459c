//! The chain store: indexed persistence of headers, blocks, coins, and undo
//! data over an ordered key-value backend.
//!
//! All mutations for one connect or disconnect go through a single atomic
//! [`WriteBatch`]. Two LRUs front the entry and height indexes so locator
//! construction, retargeting, and deployment lookups stay off disk; a
//! bounded coin cache fronts the UTXO keyspace.
//!
//! Blocks passed to [`ChainDB::connect`] must already be validated — the
//! engine is the sole writer.

use tracing::{debug, info};

use kestrel_core::block::{Block, UndoRecord};
use kestrel_core::codec::{Decodable, Encodable};
use kestrel_core::constants::RETARGET_INTERVAL;
use kestrel_core::hash::{hash160, Hash256};
use kestrel_core::params::NetworkParams;
use kestrel_core::script::opcodes::OP_RETURN;
use kestrel_core::tx::{Coin, OutPoint, Transaction};

use crate::cache::Lru;
use crate::entry::ChainEntry;
use crate::error::StoreError;
use crate::keys;
use crate::kv::{KvStore, WriteBatch};

/// Store behavior switches.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Headers-only mode: skip block, undo, coin, and index writes.
    pub spv: bool,
    /// Delete block and undo data outside the retention window.
    pub prune: bool,
    /// Maintain the txid → raw tx index.
    pub tx_index: bool,
    /// Maintain the address → tx/coin indexes.
    pub addr_index: bool,
    /// Entry/height LRU capacity.
    pub entry_cache: usize,
    /// Coin LRU capacity.
    pub coin_cache: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            spv: false,
            prune: false,
            tx_index: false,
            addr_index: false,
            // Serves locators, retargets, and versionbits windows from memory.
            entry_cache: 2 * RETARGET_INTERVAL as usize + 100,
            coin_cache: 100_000,
        }
    }
}

/// Indexed chain storage over a [`KvStore`].
pub struct ChainDB<K: KvStore> {
    kv: K,
    params: NetworkParams,
    options: StoreOptions,
    entries: Lru<Hash256, ChainEntry>,
    heights: Lru<u32, Hash256>,
    coins: Lru<OutPoint, Coin>,
    tip: ChainEntry,
}

impl<K: KvStore> ChainDB<K> {
    /// Open the store, connecting the genesis block on first use.
    pub fn open(kv: K, params: NetworkParams, options: StoreOptions) -> Result<Self, StoreError> {
        let mut db = Self {
            kv,
            tip: ChainEntry::genesis(params.genesis_block().header),
            params,
            entries: Lru::new(options.entry_cache),
            heights: Lru::new(options.entry_cache),
            coins: Lru::new(options.coin_cache),
            options,
        };

        match db.kv.get(keys::TIP)? {
            Some(bytes) => {
                let hash = decode_hash(&bytes, "R")?;
                db.tip = db
                    .read_entry(&hash)?
                    .ok_or_else(|| StoreError::Missing(format!("tip entry {hash}")))?;
                info!(height = db.tip.height, tip = %db.tip.hash(), "chain store opened");
            }
            None => {
                db.write_genesis()?;
                info!(genesis = %db.tip.hash(), "chain store initialized");
            }
        }
        Ok(db)
    }

    fn write_genesis(&mut self) -> Result<(), StoreError> {
        let genesis = self.params.genesis_block();
        let entry = ChainEntry::genesis(genesis.header);
        let hash = entry.hash();

        let mut batch = WriteBatch::new();
        batch.put(keys::entry(&hash), encode_entry(&entry)?);
        batch.put(keys::height_by_hash(&hash), 0u32.to_le_bytes().to_vec());
        batch.put(keys::hash_by_height(0), hash.as_bytes().to_vec());
        batch.put(keys::TIP, hash.as_bytes().to_vec());
        if !self.options.spv {
            // The genesis coinbase is unspendable and never enters the UTXO
            // set.
            batch.put(keys::block(&hash), genesis.encode());
        }
        self.kv.write(batch)?;
        self.tip = entry;
        Ok(())
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn tip(&self) -> &ChainEntry {
        &self.tip
    }

    pub fn height(&self) -> u32 {
        self.tip.height
    }

    // --- entry index ---

    pub fn has_entry(&mut self, hash: &Hash256) -> Result<bool, StoreError> {
        if self.entries.contains(hash) {
            return Ok(true);
        }
        self.kv.has(&keys::entry(hash))
    }

    pub fn get_entry(&mut self, hash: &Hash256) -> Result<Option<ChainEntry>, StoreError> {
        if let Some(entry) = self.entries.get(hash) {
            return Ok(Some(entry.clone()));
        }
        let entry = self.read_entry(hash)?;
        if let Some(entry) = &entry {
            self.entries.insert(*hash, entry.clone());
        }
        Ok(entry)
    }

    fn read_entry(&self, hash: &Hash256) -> Result<Option<ChainEntry>, StoreError> {
        match self.kv.get(&keys::entry(hash))? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Main-chain hash at a height.
    pub fn get_hash_by_height(&mut self, height: u32) -> Result<Option<Hash256>, StoreError> {
        if let Some(hash) = self.heights.get(&height) {
            return Ok(Some(*hash));
        }
        match self.kv.get(&keys::hash_by_height(height))? {
            Some(bytes) => {
                let hash = decode_hash(&bytes, "H")?;
                self.heights.insert(height, hash);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn get_entry_by_height(&mut self, height: u32) -> Result<Option<ChainEntry>, StoreError> {
        match self.get_hash_by_height(height)? {
            Some(hash) => self.get_entry(&hash),
            None => Ok(None),
        }
    }

    pub fn get_height(&mut self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        match self.kv.get(&keys::height_by_hash(hash))? {
            Some(bytes) if bytes.len() == 4 => {
                Ok(Some(u32::from_le_bytes(bytes.try_into().expect("len checked"))))
            }
            Some(_) => Err(StoreError::Corrupt(format!("h/{hash}"))),
            None => Ok(None),
        }
    }

    /// Forward pointer along the main chain.
    pub fn get_next_hash(&self, hash: &Hash256) -> Result<Option<Hash256>, StoreError> {
        match self.kv.get(&keys::next_hash(hash))? {
            Some(bytes) => Ok(Some(decode_hash(&bytes, "n")?)),
            None => Ok(None),
        }
    }

    /// Whether an entry lies on the main chain.
    pub fn is_main_chain(&mut self, entry: &ChainEntry) -> Result<bool, StoreError> {
        Ok(self.get_hash_by_height(entry.height)? == Some(entry.hash()))
    }

    /// Walk prev pointers to the ancestor at `height`.
    pub fn get_ancestor(
        &mut self,
        entry: &ChainEntry,
        height: u32,
    ) -> Result<Option<ChainEntry>, StoreError> {
        if height > entry.height {
            return Ok(None);
        }
        // Main-chain entries can use the height index directly.
        if self.is_main_chain(entry)? {
            return self.get_entry_by_height(height);
        }
        let mut current = entry.clone();
        while current.height > height {
            match self.get_entry(&current.header.prev)? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    // --- blocks / undo ---

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StoreError> {
        self.kv.has(&keys::block(hash))
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        match self.kv.get(&keys::block(hash))? {
            Some(bytes) => Ok(Some(
                Block::decode(&bytes).map_err(|e| StoreError::Corrupt(format!("b/{hash}: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    pub fn get_undo(&self, hash: &Hash256) -> Result<Option<UndoRecord>, StoreError> {
        match self.kv.get(&keys::undo(hash))? {
            Some(bytes) => Ok(Some(decode_bincode(&bytes, "u")?)),
            None => Ok(None),
        }
    }

    /// Raw tx lookup through the optional tx index.
    pub fn get_tx(&self, txid: &Hash256) -> Result<Option<Transaction>, StoreError> {
        match self.kv.get(&keys::tx_index(txid))? {
            Some(bytes) => Ok(Some(
                Transaction::decode(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("t/{txid}: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    // --- coins ---

    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(coin) = self.coins.get(outpoint) {
            return Ok(Some(coin.clone()));
        }
        match self.kv.get(&keys::coin(outpoint))? {
            Some(bytes) => {
                let coin: Coin = decode_bincode(&bytes, "c")?;
                self.coins.insert(*outpoint, coin.clone());
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    pub fn has_coin(&mut self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    // --- side-branch storage ---

    /// Persist an entry (and its block) that is not on the main chain.
    pub fn save_entry(&mut self, entry: &ChainEntry, block: Option<&Block>) -> Result<(), StoreError> {
        let hash = entry.hash();
        let mut batch = WriteBatch::new();
        batch.put(keys::entry(&hash), encode_entry(entry)?);
        batch.put(
            keys::height_by_hash(&hash),
            entry.height.to_le_bytes().to_vec(),
        );
        if let Some(block) = block {
            if !self.options.spv {
                batch.put(keys::block(&hash), block.encode());
            }
        }
        self.kv.write(batch)?;
        self.entries.insert(hash, entry.clone());
        Ok(())
    }

    // --- connect / disconnect ---

    /// Connect a validated block as the new tip.
    ///
    /// `undo` carries the coins spent by the block in input order. All
    /// writes land in one atomic batch.
    pub fn connect(
        &mut self,
        entry: &ChainEntry,
        block: &Block,
        undo: &UndoRecord,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(entry.header.prev, self.tip.hash());
        let hash = entry.hash();
        let mut batch = WriteBatch::new();

        batch.put(keys::entry(&hash), encode_entry(entry)?);
        batch.put(
            keys::height_by_hash(&hash),
            entry.height.to_le_bytes().to_vec(),
        );
        batch.put(keys::hash_by_height(entry.height), hash.as_bytes().to_vec());
        batch.put(keys::next_hash(&entry.header.prev), hash.as_bytes().to_vec());
        batch.put(keys::TIP, hash.as_bytes().to_vec());

        if !self.options.spv {
            batch.put(keys::block(&hash), block.encode());
            batch.put(keys::undo(&hash), encode_bincode(undo)?);
            self.apply_coin_changes(&mut batch, entry, block, undo)?;
            if self.options.prune {
                self.schedule_pruning(&mut batch, entry, &hash)?;
            }
        }

        self.kv.write(batch)?;
        self.entries.insert(hash, entry.clone());
        self.heights.insert(entry.height, hash);
        self.tip = entry.clone();
        debug!(height = entry.height, %hash, "block connected");
        Ok(())
    }

    fn apply_coin_changes(
        &mut self,
        batch: &mut WriteBatch,
        entry: &ChainEntry,
        block: &Block,
        undo: &UndoRecord,
    ) -> Result<(), StoreError> {
        // Creations land before spends so an output created and consumed
        // within this block ends up absent.
        for tx in &block.txs {
            let txid = tx.txid();
            if self.options.tx_index {
                batch.put(keys::tx_index(&txid), tx.encode());
            }
            for (index, output) in tx.outputs().iter().enumerate() {
                if output.script_pubkey.first() == Some(&OP_RETURN) {
                    continue;
                }
                let outpoint = OutPoint { txid, index: index as u32 };
                let coin = Coin {
                    output: output.clone(),
                    height: entry.height,
                    coinbase: tx.is_coinbase(),
                };
                batch.put(keys::coin(&outpoint), encode_bincode(&coin)?);
                if self.options.addr_index {
                    if let Some(addr) = addr_key(&output.script_pubkey) {
                        batch.put(keys::addr_coin(&addr, &outpoint), vec![0u8]);
                        batch.put(keys::addr_tx(&addr, &txid), vec![0u8]);
                    }
                }
                self.coins.insert(outpoint, coin);
            }
        }
        // Remove spent coins.
        for (outpoint, coin) in &undo.spent {
            batch.delete(keys::coin(outpoint));
            self.coins.remove(outpoint);
            if self.options.addr_index {
                if let Some(addr) = addr_key(&coin.output.script_pubkey) {
                    batch.delete(keys::addr_coin(&addr, outpoint));
                }
            }
        }
        Ok(())
    }

    fn schedule_pruning(
        &mut self,
        batch: &mut WriteBatch,
        entry: &ChainEntry,
        hash: &Hash256,
    ) -> Result<(), StoreError> {
        batch.put(
            keys::prune_queue(entry.height + self.params.keep_blocks),
            hash.as_bytes().to_vec(),
        );
        // Dequeue whatever was scheduled for the height we just reached.
        let queue_key = keys::prune_queue(entry.height);
        if let Some(bytes) = self.kv.get(&queue_key)? {
            let target = decode_hash(&bytes, "bq")?;
            let target_height = entry.height.saturating_sub(self.params.keep_blocks);
            if target_height > self.params.prune_after_height {
                batch.delete(keys::block(&target));
                batch.delete(keys::undo(&target));
                debug!(height = target_height, hash = %target, "pruned block");
            }
            batch.delete(queue_key);
        }
        Ok(())
    }

    /// Disconnect the tip, restoring the UTXO set from its undo record.
    ///
    /// Returns the disconnected block.
    pub fn disconnect(&mut self) -> Result<Block, StoreError> {
        let tip = self.tip.clone();
        let hash = tip.hash();
        let block = self
            .get_block(&hash)?
            .ok_or_else(|| StoreError::Missing(format!("block {hash}")))?;
        let undo = self
            .get_undo(&hash)?
            .ok_or_else(|| StoreError::Missing(format!("undo {hash}")))?;
        let parent = self
            .get_entry(&tip.header.prev)?
            .ok_or_else(|| StoreError::Missing(format!("parent of {hash}")))?;

        let mut batch = WriteBatch::new();

        // Restore spent coins first; deleting the block's own outputs after
        // keeps an output created and spent in the same block absent.
        for (outpoint, coin) in &undo.spent {
            batch.put(keys::coin(outpoint), encode_bincode(coin)?);
            if self.options.addr_index {
                if let Some(addr) = addr_key(&coin.output.script_pubkey) {
                    batch.put(keys::addr_coin(&addr, outpoint), vec![0u8]);
                }
            }
            self.coins.insert(*outpoint, coin.clone());
        }

        // Remove coins created by this block.
        for tx in &block.txs {
            let txid = tx.txid();
            for (index, output) in tx.outputs().iter().enumerate() {
                if output.script_pubkey.first() == Some(&OP_RETURN) {
                    continue;
                }
                let outpoint = OutPoint { txid, index: index as u32 };
                batch.delete(keys::coin(&outpoint));
                self.coins.remove(&outpoint);
                if self.options.addr_index {
                    if let Some(addr) = addr_key(&output.script_pubkey) {
                        batch.delete(keys::addr_coin(&addr, &outpoint));
                    }
                }
            }
        }

        batch.delete(keys::undo(&hash));
        batch.delete(keys::hash_by_height(tip.height));
        batch.delete(keys::next_hash(&tip.header.prev));
        batch.put(keys::TIP, parent.hash().as_bytes().to_vec());

        self.kv.write(batch)?;
        self.heights.remove(&tip.height);
        self.tip = parent;
        debug!(height = tip.height, %hash, "block disconnected");
        Ok(block)
    }

    /// Raw keyspace snapshot for one prefix; test and audit support.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.kv.scan_prefix(prefix)
    }
}

/// Address key for the optional address indexes: HASH160 of the locking
/// script.
fn addr_key(script: &[u8]) -> Option<[u8; 20]> {
    if script.is_empty() || script.first() == Some(&OP_RETURN) {
        return None;
    }
    Some(hash160(script))
}

fn encode_entry(entry: &ChainEntry) -> Result<Vec<u8>, StoreError> {
    encode_bincode(entry)
}

fn decode_entry(bytes: &[u8]) -> Result<ChainEntry, StoreError> {
    decode_bincode(bytes, "e")
}

fn encode_bincode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode_bincode<T: bincode::Decode<()>>(bytes: &[u8], what: &str) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn decode_hash(bytes: &[u8], what: &str) -> Result<Hash256, StoreError> {
    if bytes.len() != 32 {
        return Err(StoreError::Corrupt(what.to_string()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(Hash256(out))
}
