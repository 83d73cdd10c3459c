//! Chain entries: a header with its derived height and cumulative work.

use kestrel_core::block::BlockHeader;
use kestrel_core::hash::Hash256;
use kestrel_core::pow::U256;

/// A header plus the position-dependent values derived when it was linked
/// into the index.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ChainEntry {
    pub header: BlockHeader,
    pub height: u32,
    /// Accumulated work of the chain ending at this entry.
    pub chainwork: U256,
}

impl ChainEntry {
    /// Link a header under its parent, deriving height and chainwork.
    pub fn link(header: BlockHeader, parent: &ChainEntry) -> Self {
        let (target, _, _) = U256::from_compact(header.bits);
        let chainwork = parent
            .chainwork
            .checked_add(&target.to_work())
            .unwrap_or(U256::MAX);
        Self { header, height: parent.height + 1, chainwork }
    }

    /// The genesis entry: height zero, chainwork equal to its own work.
    pub fn genesis(header: BlockHeader) -> Self {
        let (target, _, _) = U256::from_compact(header.bits);
        Self { header, height: 0, chainwork: target.to_work() }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// Validation state of a known entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Never seen.
    Unknown,
    /// Parked awaiting its parent.
    Orphan,
    /// Linked into the index but not connected to the main chain.
    Headers,
    /// Connected and fully validated.
    Valid,
    /// Failed consensus; descendants fail fast.
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1_300_000_000,
            bits,
            nonce,
        }
    }

    #[test]
    fn genesis_work_is_own_target_work() {
        let entry = ChainEntry::genesis(header(0x1d00ffff, 0));
        assert_eq!(entry.height, 0);
        let (target, _, _) = U256::from_compact(0x1d00ffff);
        assert_eq!(entry.chainwork, target.to_work());
    }

    #[test]
    fn link_accumulates_work_and_height() {
        let genesis = ChainEntry::genesis(header(0x1d00ffff, 0));
        let child = ChainEntry::link(header(0x1d00ffff, 1), &genesis);
        assert_eq!(child.height, 1);
        assert!(child.chainwork > genesis.chainwork);
        let (target, _, _) = U256::from_compact(0x1d00ffff);
        assert_eq!(
            child.chainwork,
            genesis.chainwork.checked_add(&target.to_work()).unwrap()
        );
    }

    #[test]
    fn chainwork_strictly_increases_along_chain() {
        let mut entry = ChainEntry::genesis(header(0x207fffff, 0));
        let mut previous_work = entry.chainwork;
        for nonce in 1..20 {
            entry = ChainEntry::link(header(0x207fffff, nonce), &entry);
            assert!(entry.chainwork > previous_work);
            previous_work = entry.chainwork;
        }
        assert_eq!(entry.height, 19);
    }

    #[test]
    fn bincode_round_trip() {
        let entry = ChainEntry::genesis(header(0x1d00ffff, 7));
        let encoded = bincode::encode_to_vec(&entry, bincode::config::standard()).unwrap();
        let (decoded, _): (ChainEntry, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded, entry);
    }
}
