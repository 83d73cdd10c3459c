//! SHA-256d merkle trees: block merkle roots, the witness commitment, and
//! the partial merkle tree carried by `merkleblock`.
//!
//! Nodes hash the concatenation of their children; odd layers duplicate the
//! last element. Duplicate-pair mutation (CVE-2012-2459) is surfaced so block
//! validation can reject mutated blocks whose root still matches.

use crate::codec::{self, Decodable, Encodable, Reader};
use crate::error::CodecError;
use crate::hash::{hash256, Hash256};
use crate::tx::Transaction;

/// Hash an internal node: SHA-256d of the concatenated children.
fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    hash256(&buf)
}

/// Compute the merkle root over leaf hashes.
///
/// Returns `(root, mutated)`: `mutated` is true when any layer paired two
/// identical hashes, the malleation a duplicate-transaction block exploits.
/// An empty slice yields the zero hash.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }
    let mut mutated = false;
    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            next.push(node_hash(left, right));
        }
        layer = next;
    }
    (layer[0], mutated)
}

/// Merkle root over a block's txids.
pub fn block_merkle_root(txs: &[Transaction]) -> (Hash256, bool) {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
    merkle_root(&txids)
}

/// Witness merkle root: wtxids with the coinbase entry zeroed.
pub fn witness_merkle_root(txs: &[Transaction]) -> Hash256 {
    let mut leaves: Vec<Hash256> = txs.iter().map(|tx| tx.wtxid()).collect();
    if let Some(first) = leaves.first_mut() {
        *first = Hash256::ZERO;
    }
    merkle_root(&leaves).0
}

/// Header bytes of the witness commitment output:
/// `OP_RETURN PUSH36 0xaa21a9ed`.
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Compute the witness commitment: SHA-256d(witness root || nonce).
pub fn witness_commitment(witness_root: &Hash256, nonce: &[u8; 32]) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(witness_root.as_bytes());
    buf[32..].copy_from_slice(nonce);
    hash256(&buf)
}

/// Find the witness commitment in a coinbase's outputs.
///
/// The last output whose script starts with the commitment header wins.
pub fn find_witness_commitment(coinbase: &Transaction) -> Option<Hash256> {
    coinbase
        .outputs()
        .iter()
        .rev()
        .find(|out| {
            out.script_pubkey.len() >= 38
                && out.script_pubkey[..6] == WITNESS_COMMITMENT_HEADER
        })
        .map(|out| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&out.script_pubkey[6..38]);
            Hash256(bytes)
        })
}

/// Partial merkle tree (BIP37): proves inclusion of matched txids without
/// shipping the whole block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMerkleTree {
    /// Total transactions in the block.
    pub num_tx: u32,
    /// Depth-first traversal flags, one bit per visited node.
    pub bits: Vec<bool>,
    /// Hashes for pruned subtrees and matched leaves, traversal order.
    pub hashes: Vec<Hash256>,
}

impl PartialMerkleTree {
    /// Build from a block's txids and a parallel match vector.
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Self {
        assert_eq!(txids.len(), matches.len());
        let mut tree = Self { num_tx: txids.len() as u32, bits: Vec::new(), hashes: Vec::new() };
        if txids.is_empty() {
            return tree;
        }
        let height = tree.tree_height();
        tree.traverse_build(height, 0, txids, matches);
        tree
    }

    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.width_at(height) > 1 {
            height += 1;
        }
        height
    }

    /// Number of nodes at a given height (0 = leaves).
    fn width_at(&self, height: u32) -> u32 {
        (self.num_tx + (1 << height) - 1) >> height
    }

    fn subtree_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.width_at(height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        node_hash(&left, &right)
    }

    fn traverse_build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        // Does any leaf under this node match?
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(txids.len());
        let parent_of_match = matches[start..end].iter().any(|m| *m);
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos, txids));
        } else {
            self.traverse_build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.width_at(height - 1) {
                self.traverse_build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    /// Rebuild the merkle root, collecting matched txids and their indexes.
    ///
    /// Returns `None` when the encoding is inconsistent (unconsumed bits or
    /// hashes, overflowing width, or identical left/right children).
    pub fn extract_matches(&self, matched: &mut Vec<(u32, Hash256)>) -> Option<Hash256> {
        matched.clear();
        if self.num_tx == 0 || self.hashes.len() as u32 > self.num_tx {
            return None;
        }
        if self.bits.len() < self.hashes.len() {
            return None;
        }
        let mut bits_used = 0usize;
        let mut hashes_used = 0usize;
        let root = self.traverse_extract(
            self.tree_height(),
            0,
            &mut bits_used,
            &mut hashes_used,
            matched,
        )?;
        // Bits arrive byte-padded on the wire; only whole unused bytes are
        // an inconsistency.
        if bits_used.div_ceil(8) != self.bits.len().div_ceil(8)
            || hashes_used != self.hashes.len()
        {
            return None;
        }
        Some(root)
    }

    fn traverse_extract(
        &self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matched: &mut Vec<(u32, Hash256)>,
    ) -> Option<Hash256> {
        if *bits_used >= self.bits.len() {
            return None;
        }
        let parent_of_match = self.bits[*bits_used];
        *bits_used += 1;
        if height == 0 || !parent_of_match {
            if *hashes_used >= self.hashes.len() {
                return None;
            }
            let hash = self.hashes[*hashes_used];
            *hashes_used += 1;
            if height == 0 && parent_of_match {
                matched.push((pos, hash));
            }
            return Some(hash);
        }
        let left = self.traverse_extract(height - 1, pos * 2, bits_used, hashes_used, matched)?;
        let right = if pos * 2 + 1 < self.width_at(height - 1) {
            let right = self.traverse_extract(height - 1, pos * 2 + 1, bits_used, hashes_used, matched)?;
            if right == left {
                // Identical children encode a mutated tree.
                return None;
            }
            right
        } else {
            left
        };
        Some(node_hash(&left, &right))
    }
}

impl Encodable for PartialMerkleTree {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.num_tx.to_le_bytes());
        codec::write_varint(buf, self.hashes.len() as u64);
        for hash in &self.hashes {
            hash.encode_to(buf);
        }
        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        codec::write_var_bytes(buf, &bytes);
    }
}

impl Decodable for PartialMerkleTree {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let num_tx = r.read_u32()?;
        let count = r.read_count(32)?;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(r.read_hash()?);
        }
        let bytes = r.read_var_bytes()?;
        let mut bits = Vec::with_capacity(bytes.len() * 8);
        for byte in &bytes {
            for bit in 0..8 {
                bits.push(byte & (1 << bit) != 0);
            }
        }
        Ok(Self { num_tx, bits, hashes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{OutPoint, TxBuilder};

    fn h(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    fn tx_with_nonce(nonce: u8) -> Transaction {
        TxBuilder::new()
            .input(OutPoint { txid: Hash256([nonce; 32]), index: 0 }, vec![nonce], 0)
            .output(1, vec![0x51])
            .finalize()
    }

    // --- merkle root ---

    #[test]
    fn root_empty() {
        assert_eq!(merkle_root(&[]), (Hash256::ZERO, false));
    }

    #[test]
    fn root_single_is_leaf() {
        assert_eq!(merkle_root(&[h(1)]).0, h(1));
    }

    #[test]
    fn root_two_is_pair_hash() {
        let expected = node_hash(&h(1), &h(2));
        assert_eq!(merkle_root(&[h(1), h(2)]).0, expected);
    }

    #[test]
    fn root_odd_duplicates_last() {
        let left = node_hash(&h(1), &h(2));
        let right = node_hash(&h(3), &h(3));
        assert_eq!(merkle_root(&[h(1), h(2), h(3)]).0, node_hash(&left, &right));
        // Trailing duplication is not flagged as mutation.
        assert!(!merkle_root(&[h(1), h(2), h(3)]).1);
    }

    #[test]
    fn root_detects_duplicate_pair_mutation() {
        // [1,2,3,3] pairs two identical hashes in a full pair.
        let (root_a, mutated) = merkle_root(&[h(1), h(2), h(3), h(3)]);
        assert!(mutated);
        // Same root as the odd-count tree it malleates.
        assert_eq!(root_a, merkle_root(&[h(1), h(2), h(3)]).0);
    }

    #[test]
    fn root_order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]).0, merkle_root(&[h(2), h(1)]).0);
    }

    // --- witness commitment ---

    #[test]
    fn witness_root_zeroes_coinbase() {
        let coinbase = TxBuilder::new()
            .input(OutPoint::null(), vec![0x00, 0x00], 0)
            .output(0, vec![])
            .finalize();
        let tx = tx_with_nonce(7);
        let root = witness_merkle_root(&[coinbase, tx.clone()]);
        assert_eq!(root, merkle_root(&[Hash256::ZERO, tx.wtxid()]).0);
    }

    #[test]
    fn commitment_found_in_coinbase() {
        let commitment = witness_commitment(&h(9), &[0u8; 32]);
        let mut script = WITNESS_COMMITMENT_HEADER.to_vec();
        script.extend_from_slice(commitment.as_bytes());
        let coinbase = TxBuilder::new()
            .input(OutPoint::null(), vec![0x00, 0x00], 0)
            .output(0, vec![0x51])
            .output(0, script)
            .finalize();
        assert_eq!(find_witness_commitment(&coinbase), Some(commitment));
    }

    #[test]
    fn commitment_absent() {
        let coinbase = TxBuilder::new()
            .input(OutPoint::null(), vec![0x00, 0x00], 0)
            .output(0, vec![0x51])
            .finalize();
        assert_eq!(find_witness_commitment(&coinbase), None);
    }

    // --- partial merkle tree ---

    #[test]
    fn partial_tree_single_match() {
        let txids: Vec<Hash256> = (0..7).map(h).collect();
        let mut matches = vec![false; 7];
        matches[3] = true;
        let tree = PartialMerkleTree::from_txids(&txids, &matches);

        let mut matched = Vec::new();
        let root = tree.extract_matches(&mut matched).unwrap();
        assert_eq!(root, merkle_root(&txids).0);
        assert_eq!(matched, vec![(3, h(3))]);
    }

    #[test]
    fn partial_tree_no_matches() {
        let txids: Vec<Hash256> = (0..4).map(h).collect();
        let tree = PartialMerkleTree::from_txids(&txids, &[false; 4]);
        let mut matched = Vec::new();
        let root = tree.extract_matches(&mut matched).unwrap();
        assert_eq!(root, merkle_root(&txids).0);
        assert!(matched.is_empty());
        // Fully pruned: a single hash.
        assert_eq!(tree.hashes.len(), 1);
    }

    #[test]
    fn partial_tree_all_matches() {
        let txids: Vec<Hash256> = (0..5).map(h).collect();
        let tree = PartialMerkleTree::from_txids(&txids, &[true; 5]);
        let mut matched = Vec::new();
        let root = tree.extract_matches(&mut matched).unwrap();
        assert_eq!(root, merkle_root(&txids).0);
        assert_eq!(matched.len(), 5);
    }

    #[test]
    fn partial_tree_round_trip() {
        let txids: Vec<Hash256> = (0..11).map(h).collect();
        let mut matches = vec![false; 11];
        matches[0] = true;
        matches[10] = true;
        let tree = PartialMerkleTree::from_txids(&txids, &matches);
        let decoded = PartialMerkleTree::decode(&tree.encode()).unwrap();
        // Bit padding may append trailing false bits; roots must still agree.
        let mut matched = Vec::new();
        let root = decoded.extract_matches(&mut matched).unwrap();
        assert_eq!(root, merkle_root(&txids).0);
        assert_eq!(matched.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 10]);
    }

    #[test]
    fn partial_tree_rejects_empty() {
        let tree = PartialMerkleTree { num_tx: 0, bits: vec![], hashes: vec![] };
        let mut matched = Vec::new();
        assert!(tree.extract_matches(&mut matched).is_none());
    }

    #[test]
    fn block_merkle_root_over_txids() {
        let txs: Vec<Transaction> = (1..=3).map(tx_with_nonce).collect();
        let txids: Vec<Hash256> = txs.iter().map(|t| t.txid()).collect();
        assert_eq!(block_merkle_root(&txs).0, merkle_root(&txids).0);
    }
}
