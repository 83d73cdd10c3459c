//! Regtest chain-building helpers shared by the integration tests.

use kestrel_chain::entry::ChainEntry;
use kestrel_chain::kv::MemoryKv;
use kestrel_chain::store::{ChainDB, StoreOptions};
use kestrel_chain::Chain;
use kestrel_core::block::{Block, BlockHeader};
use kestrel_core::constants::COIN;
use kestrel_core::hash::Hash256;
use kestrel_core::merkle;
use kestrel_core::params::{Network, NetworkParams};
use kestrel_core::pow::check_proof_of_work;
use kestrel_core::script;
use kestrel_core::tx::{OutPoint, Transaction, TxBuilder};

/// A fixed test clock far past any regtest header timestamp.
pub const TEST_TIME: u64 = 1_600_000_000;

/// Fresh regtest chain over in-memory storage with an injected clock.
pub fn regtest_chain() -> Chain<MemoryKv> {
    let db = ChainDB::open(
        MemoryKv::new(),
        NetworkParams::new(Network::Regtest),
        StoreOptions::default(),
    )
    .expect("open in-memory chain");
    Chain::with_clock(db, || TEST_TIME)
}

/// A coinbase carrying the BIP34 height push and an extranonce.
pub fn coinbase(height: u32, tweak: u8) -> Transaction {
    let mut script_sig = Vec::new();
    script::push_num(&mut script_sig, height as i64);
    script::push_data(&mut script_sig, &[tweak, 0xee, 0xff]);
    TxBuilder::new()
        .input(OutPoint::null(), script_sig, 0xffff_ffff)
        .output(50 * COIN, vec![0x51])
        .finalize()
}

/// Mine a regtest block on `parent`: grind the nonce until the proof of
/// work passes.
pub fn mine(parent: &ChainEntry, txs: Vec<Transaction>, time: u32) -> Block {
    let (merkle_root, _) = merkle::block_merkle_root(&txs);
    let mut header = BlockHeader {
        version: 4,
        prev: parent.hash(),
        merkle_root,
        time,
        bits: 0x207fffff,
        nonce: 0,
    };
    let limit = NetworkParams::new(Network::Regtest).pow_limit;
    while !check_proof_of_work(&header.hash(), header.bits, &limit) {
        header.nonce += 1;
    }
    Block { header, txs }
}

/// Extend the chain tip with a fresh coinbase-only block.
pub fn extend(chain: &mut Chain<MemoryKv>, tweak: u8) -> Block {
    let parent = chain.tip();
    let block = mine(
        &parent,
        vec![coinbase(parent.height + 1, tweak)],
        parent.header.time + 600,
    );
    chain.add(block.clone()).expect("extend chain");
    block
}

/// A simple anyone-can-spend transaction consuming `outpoint`.
pub fn spend(outpoint: OutPoint, value: i64) -> Transaction {
    TxBuilder::new()
        .input(outpoint, vec![], 0xffff_ffff)
        .output(value, vec![0x51])
        .finalize()
}

/// Build a linked side branch of `len` blocks starting from `parent`.
pub fn branch(parent: &ChainEntry, len: usize, tweak: u8, spacing: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut entry = parent.clone();
    for i in 0..len {
        let block = mine(
            &entry,
            vec![coinbase(entry.height + 1, tweak.wrapping_add(i as u8))],
            entry.header.time + spacing,
        );
        entry = ChainEntry::link(block.header, &entry);
        blocks.push(block);
    }
    blocks
}

/// Hash of a block list, tip last.
pub fn tip_hash(blocks: &[Block]) -> Hash256 {
    blocks.last().expect("nonempty branch").hash()
}
