//! BIP37 bloom filters and the rolling variant used for recently-known
//! inventory tracking.
//!
//! Hashing is MurmurHash3 (x86 32-bit) seeded per function as
//! `i * 0xfba4c795 + tweak`, per the BIP.

use kestrel_core::tx::{OutPoint, Transaction};

use kestrel_core::codec::Encodable;

/// Maximum serialized filter size in bytes.
pub const MAX_BLOOM_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_BLOOM_HASHES: u32 = 50;

const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;
const LN2: f64 = 0.693_147_180_559_945_3;

/// MurmurHash3 x86 32-bit.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().expect("sized"));
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k1 |= (byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Filter update behavior requested by the loading peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFlags {
    None,
    All,
    PubkeyOnly,
}

impl BloomFlags {
    pub fn from_u8(value: u8) -> Self {
        match value & 3 {
            1 => Self::All,
            2 => Self::PubkeyOnly,
            _ => Self::None,
        }
    }
}

/// A BIP37 bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    pub flags: BloomFlags,
}

impl BloomFilter {
    /// Size a filter for `items` elements at the target false-positive rate.
    pub fn from_rate(items: usize, rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let items = items.max(1) as f64;
        let bytes = (-1.0 / LN2_SQUARED * items * rate.ln() / 8.0).ceil() as usize;
        let bytes = bytes.clamp(1, MAX_BLOOM_SIZE);
        let funcs = ((bytes * 8) as f64 / items * LN2).round() as u32;
        Self {
            data: vec![0u8; bytes],
            hash_funcs: funcs.clamp(1, MAX_BLOOM_HASHES),
            tweak,
            flags,
        }
    }

    /// Reconstruct a peer-supplied filter. Returns `None` when the payload
    /// exceeds protocol limits.
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8) -> Option<Self> {
        if data.len() > MAX_BLOOM_SIZE || hash_funcs > MAX_BLOOM_HASHES || hash_funcs == 0 {
            return None;
        }
        Some(Self { data, hash_funcs, tweak, flags: BloomFlags::from_u8(flags) })
    }

    fn bit_for(&self, n: u32, item: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xfba4_c795).wrapping_add(self.tweak);
        murmur3(seed, item) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, item: &[u8]) {
        for n in 0..self.hash_funcs {
            let bit = self.bit_for(n, item);
            self.data[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let bit = self.bit_for(n, item);
            self.data[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        self.insert(&outpoint.encode());
    }

    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.contains(&outpoint.encode())
    }

    /// BIP37 transaction matching: txid, output data pushes, input
    /// outpoints, and input data pushes. Matched outpoints are fed back into
    /// the filter under the update-all flag.
    pub fn matches_tx(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let mut matched = self.contains(txid.as_bytes());

        for (index, output) in tx.outputs().iter().enumerate() {
            let mut hit = false;
            for op in kestrel_core::script::ops(&output.script_pubkey).flatten() {
                if !op.push.is_empty() && self.contains(op.push) {
                    hit = true;
                    break;
                }
            }
            if hit {
                matched = true;
                if self.flags == BloomFlags::All {
                    self.insert_outpoint(&OutPoint { txid, index: index as u32 });
                }
            }
        }
        if matched {
            return true;
        }

        for input in tx.inputs() {
            if self.contains_outpoint(&input.outpoint) {
                return true;
            }
            for op in kestrel_core::script::ops(&input.script_sig).flatten() {
                if !op.push.is_empty() && self.contains(op.push) {
                    return true;
                }
            }
        }
        false
    }
}

/// A rolling filter over the most recent insertions.
///
/// Four generation slots of half the capacity each; starting a fifth
/// generation drops the oldest. At least `capacity` of the most recent
/// insertions always match.
#[derive(Debug, Clone)]
pub struct RollingBloomFilter {
    generations: Vec<BloomFilter>,
    per_generation: usize,
    current_count: usize,
    items: usize,
    rate: f64,
    tweak: u32,
}

impl RollingBloomFilter {
    pub fn new(items: usize, rate: f64) -> Self {
        Self::with_tweak(items, rate, rand::random())
    }

    /// Deterministic construction for tests and replayable sessions.
    pub fn with_tweak(items: usize, rate: f64, tweak: u32) -> Self {
        let per_generation = items.div_ceil(2);
        Self {
            generations: vec![BloomFilter::from_rate(per_generation, rate, tweak, BloomFlags::None)],
            per_generation,
            current_count: 0,
            items,
            rate,
            tweak,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        if self.current_count >= self.per_generation {
            if self.generations.len() >= 4 {
                self.generations.remove(0);
            }
            self.generations.push(BloomFilter::from_rate(
                self.per_generation,
                self.rate,
                self.tweak,
                BloomFlags::None,
            ));
            self.current_count = 0;
        }
        self.generations
            .last_mut()
            .expect("at least one generation")
            .insert(item);
        self.current_count += 1;
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.generations.iter().any(|gen| gen.contains(item))
    }

    /// Guaranteed retention window.
    pub fn capacity(&self) -> usize {
        self.items
    }
}
