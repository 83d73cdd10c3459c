//! Inventory items for inv/getdata/notfound flows.

use kestrel_core::codec::{Decodable, Encodable, Reader};
use kestrel_core::error::CodecError;
use kestrel_core::hash::Hash256;

/// Witness flag ORed onto getdata inventory types.
pub const WITNESS_MASK: u32 = 0x4000_0000;

/// Base inventory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Error => 0,
            Self::Tx => 1,
            Self::Block => 2,
            Self::FilteredBlock => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Error),
            1 => Some(Self::Tx),
            2 => Some(Self::Block),
            3 => Some(Self::FilteredBlock),
            _ => None,
        }
    }
}

/// One inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    /// Witness mask seen on the wire; meaningful on getdata only.
    pub witness: bool,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        Self { inv_type: InvType::Tx, witness: false, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self { inv_type: InvType::Block, witness: false, hash }
    }

    pub fn filtered_block(hash: Hash256) -> Self {
        Self { inv_type: InvType::FilteredBlock, witness: false, hash }
    }

    pub fn with_witness(mut self) -> Self {
        self.witness = true;
        self
    }
}

impl Encodable for InvItem {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        let mut raw = self.inv_type.to_u32();
        if self.witness {
            raw |= WITNESS_MASK;
        }
        buf.extend_from_slice(&raw.to_le_bytes());
        self.hash.encode_to(buf);
    }
}

impl Decodable for InvItem {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let raw = r.read_u32()?;
        let witness = raw & WITNESS_MASK != 0;
        let inv_type = InvType::from_u32(raw & !WITNESS_MASK)
            .ok_or_else(|| CodecError::InvalidValue(format!("inv type {raw}")))?;
        let hash = r.read_hash()?;
        Ok(Self { inv_type, witness, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let item = InvItem::block(Hash256([7; 32]));
        let decoded = InvItem::decode(&item.encode()).unwrap();
        assert_eq!(decoded, item);
        assert!(!decoded.witness);
    }

    #[test]
    fn round_trip_witness_mask() {
        let item = InvItem::tx(Hash256([9; 32])).with_witness();
        let encoded = item.encode();
        assert_eq!(u32::from_le_bytes(encoded[..4].try_into().unwrap()), 1 | WITNESS_MASK);
        let decoded = InvItem::decode(&encoded).unwrap();
        assert!(decoded.witness);
        assert_eq!(decoded.inv_type, InvType::Tx);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut encoded = InvItem::tx(Hash256::ZERO).encode();
        encoded[0] = 9;
        assert!(InvItem::decode(&encoded).is_err());
    }
}
