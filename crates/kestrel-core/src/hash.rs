//! Hashing primitives: SHA-256d and HASH160.
//!
//! All 32-byte hashes are stored in internal (little-endian) byte order and
//! displayed reversed, matching the convention used on the wire and in the
//! store key space.

use std::fmt;

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte hash in internal byte order.
///
/// Used for txids, wtxids, block hashes, and merkle roots. `Display` prints
/// the conventional reversed (big-endian) hex form.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash. Used for coinbase previous outpoints and as the
    /// "no tip" sentinel.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from display (reversed) hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for i in 0..32 {
            let byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
            out[31 - i] = byte;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256 (the block/tx/message-checksum hash).
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// RIPEMD-160 of SHA-256 (the pubkey/script hash).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// First four bytes of SHA-256d, used as the wire-message checksum.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let h = hash256(data);
    [h.0[0], h.0[1], h.0[2], h.0[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash256_empty_vector() {
        // SHA-256d("") well-known vector.
        let h = hash256(b"");
        assert_eq!(
            h.to_string(),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn hash160_empty_vector() {
        let h = hash160(b"");
        assert_eq!(
            h.iter().map(|b| format!("{b:02x}")).collect::<String>(),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn checksum_is_hash_prefix() {
        let data = b"kestrel";
        let h = hash256(data);
        assert_eq!(checksum(data), [h.0[0], h.0[1], h.0[2], h.0[3]]);
    }

    #[test]
    fn display_reverses_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let h = Hash256(bytes);
        let s = h.to_string();
        assert!(s.ends_with("ab"));
        assert!(s.starts_with("00"));
    }

    #[test]
    fn from_hex_round_trip() {
        let h = hash256(b"round trip");
        let parsed = Hash256::from_hex(&h.to_string()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Hash256::from_hex("abcd").is_none());
        assert!(Hash256::from_hex(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn zero_detection() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!hash256(b"x").is_zero());
    }
}
