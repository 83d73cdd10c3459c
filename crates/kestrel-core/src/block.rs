//! Block types: headers, full blocks, and per-block undo records.

use serde::{Deserialize, Serialize};

use crate::codec::{self, Decodable, Encodable, Reader};
use crate::constants::{MAX_BLOCK_WEIGHT, WITNESS_SCALE_FACTOR};
use crate::error::CodecError;
use crate::hash::{hash256, Hash256};
use crate::merkle;
use crate::tx::{Coin, Transaction};

/// An 80-byte block header.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Version / versionbits field.
    pub version: i32,
    /// Hash of the previous block header.
    pub prev: Hash256,
    /// Merkle root over the block's txids.
    pub merkle_root: Hash256,
    /// Unix timestamp.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Block hash: SHA-256d over the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        hash256(&self.encode())
    }
}

impl Encodable for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        self.prev.encode_to(buf);
        self.merkle_root.encode_to(buf);
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decodable for BlockHeader {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.read_i32()?,
            prev: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }
}

/// A complete block: header plus transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first()
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> usize {
        80 + codec::varint_len(self.txs.len() as u64)
            + self.txs.iter().map(|tx| tx.base_size()).sum::<usize>()
    }

    /// Full serialized size.
    pub fn total_size(&self) -> usize {
        80 + codec::varint_len(self.txs.len() as u64)
            + self.txs.iter().map(|tx| tx.total_size()).sum::<usize>()
    }

    /// BIP141 block weight.
    pub fn weight(&self) -> usize {
        self.base_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    pub fn has_witness(&self) -> bool {
        self.txs.iter().any(|tx| tx.has_witness())
    }

    /// Context-free structural checks: weight bound, coinbase placement, and
    /// a merkle root that matches without duplicate-pair mutation.
    pub fn check_sanity(&self) -> Result<(), BlockSanityError> {
        if self.txs.is_empty() {
            return Err(BlockSanityError::Empty);
        }
        if self.weight() > MAX_BLOCK_WEIGHT {
            return Err(BlockSanityError::OverWeight(self.weight()));
        }
        if !self.txs[0].is_coinbase() {
            return Err(BlockSanityError::FirstNotCoinbase);
        }
        for tx in &self.txs[1..] {
            if tx.is_coinbase() {
                return Err(BlockSanityError::ExtraCoinbase);
            }
        }
        let (root, mutated) = merkle::block_merkle_root(&self.txs);
        if mutated {
            return Err(BlockSanityError::MutatedMerkle);
        }
        if root != self.header.merkle_root {
            return Err(BlockSanityError::BadMerkleRoot);
        }
        Ok(())
    }
}

/// Structural block failures surfaced by [`Block::check_sanity`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockSanityError {
    #[error("block has no transactions")] Empty,
    #[error("block weight {0} exceeds limit")] OverWeight(usize),
    #[error("first transaction is not a coinbase")] FirstNotCoinbase,
    #[error("more than one coinbase")] ExtraCoinbase,
    #[error("duplicate-pair merkle mutation")] MutatedMerkle,
    #[error("merkle root does not match header")] BadMerkleRoot,
}

impl Encodable for Block {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.header.encode_to(buf);
        codec::write_varint(buf, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode_to(buf);
        }
    }
}

impl Decodable for Block {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode_from(r)?;
        let count = r.read_count(60)?;
        let mut txs = Vec::with_capacity(count);
        for _ in 0..count {
            txs.push(Transaction::decode_from(r)?);
        }
        Ok(Self { header, txs })
    }
}

/// Spent coins of one block, in input-traversal order.
///
/// Written when the block connects; consumed to restore the UTXO set when it
/// disconnects.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UndoRecord {
    pub spent: Vec<(crate::tx::OutPoint, Coin)>,
}

impl UndoRecord {
    pub fn new() -> Self {
        Self { spent: Vec::new() }
    }

    pub fn push(&mut self, outpoint: crate::tx::OutPoint, coin: Coin) {
        self.spent.push((outpoint, coin));
    }

    pub fn len(&self) -> usize {
        self.spent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }
}
