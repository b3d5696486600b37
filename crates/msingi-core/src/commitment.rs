//! anonymous device commitments
//!
//! A commitment is the only device identifier the server ever holds:
//! `C = H(pk || r)` computed on the device. Identity is by byte value.

use crate::hash::{commitment_hash, Hash};
use std::fmt;

/// 32-byte blind registration commitment
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Commitment(pub Hash);

impl Commitment {
    pub fn from_bytes(bytes: Hash) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> Hash {
        self.0
    }

    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// parse from a 64-char hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        crate::parse_hex32(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// derive a commitment the way device firmware does
    pub fn derive(pk: &[u8; 64], blinding: &[u8; 32]) -> Self {
        Self(commitment_hash(pk, blinding))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for Commitment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let c = Commitment([0xab; 32]);
        let parsed = Commitment::from_hex(&c.to_hex()).unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn rejects_short_hex() {
        assert!(Commitment::from_hex("abcd").is_none());
        assert!(Commitment::from_hex("not hex at all").is_none());
    }

    #[test]
    fn derive_binds_key_and_blinding() {
        let pk = [3u8; 64];
        let c1 = Commitment::derive(&pk, &[1u8; 32]);
        let c2 = Commitment::derive(&pk, &[2u8; 32]);
        assert_ne!(c1, c2);
    }
}
