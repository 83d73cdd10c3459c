//! Chain store key layout.
//!
//! Single-byte prefixes partition the key space; heights are big-endian so
//! prefix scans iterate in height order. Hashes are stored in internal
//! (little-endian) byte order.
//!
//! | Prefix | Key              | Value                  |
//! |--------|------------------|------------------------|
//! | `R`    | —                | tip hash               |
//! | `e`    | hash             | serialized ChainEntry  |
//! | `h`    | hash             | height (u32 LE)        |
//! | `H`    | height (u32 BE)  | hash                   |
//! | `n`    | hash             | next main-chain hash   |
//! | `b`    | hash             | raw block bytes        |
//! | `bq`   | height (u32 BE)  | hash scheduled to prune|
//! | `u`    | hash             | serialized UndoRecord  |
//! | `c`    | txid ∥ index LE  | serialized Coin        |
//! | `t`    | txid             | raw tx bytes           |
//! | `T`    | addr ∥ txid      | ∅                      |
//! | `C`    | addr ∥ txid ∥ ix | ∅                      |

use kestrel_core::hash::Hash256;
use kestrel_core::tx::OutPoint;

pub const TIP: &[u8] = b"R";

pub fn entry(hash: &Hash256) -> Vec<u8> {
    prefixed(b'e', hash.as_bytes())
}

pub fn height_by_hash(hash: &Hash256) -> Vec<u8> {
    prefixed(b'h', hash.as_bytes())
}

pub fn hash_by_height(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'H');
    key.extend_from_slice(&height.to_be_bytes());
    key
}

pub fn next_hash(hash: &Hash256) -> Vec<u8> {
    prefixed(b'n', hash.as_bytes())
}

pub fn block(hash: &Hash256) -> Vec<u8> {
    prefixed(b'b', hash.as_bytes())
}

pub fn prune_queue(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(6);
    key.extend_from_slice(b"bq");
    key.extend_from_slice(&height.to_be_bytes());
    key
}

pub fn undo(hash: &Hash256) -> Vec<u8> {
    prefixed(b'u', hash.as_bytes())
}

pub fn coin(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b'c');
    key.extend_from_slice(outpoint.txid.as_bytes());
    key.extend_from_slice(&outpoint.index.to_le_bytes());
    key
}

pub fn tx_index(txid: &Hash256) -> Vec<u8> {
    prefixed(b't', txid.as_bytes())
}

pub fn addr_tx(addr: &[u8; 20], txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(53);
    key.push(b'T');
    key.extend_from_slice(addr);
    key.extend_from_slice(txid.as_bytes());
    key
}

pub fn addr_coin(addr: &[u8; 20], outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(57);
    key.push(b'C');
    key.extend_from_slice(addr);
    key.extend_from_slice(outpoint.txid.as_bytes());
    key.extend_from_slice(&outpoint.index.to_le_bytes());
    key
}

/// Prefix for scanning all tx keys of one address.
pub fn addr_tx_prefix(addr: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'T');
    key.extend_from_slice(addr);
    key
}

/// Prefix for scanning all coin keys of one address.
pub fn addr_coin_prefix(addr: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'C');
    key.extend_from_slice(addr);
    key
}

fn prefixed(prefix: u8, bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + bytes.len());
    key.push(prefix);
    key.extend_from_slice(bytes);
    key
}
