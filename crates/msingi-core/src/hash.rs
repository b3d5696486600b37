//! domain-separated hashing
//!
//! Single primitive: SHA-256. Every semantic hash is
//! `SHA256(domain_tag || payload)` with a fixed ASCII tag per use.
//! The node and leaf tags must match the device firmware and the ZK
//! circuit byte-for-byte; changing one is a consensus break.

use sha2::{Digest, Sha256};

/// 32-byte hash type
pub type Hash = [u8; 32];

pub const DOMAIN_COMMITMENT: &[u8] = b"msingi:commitment:";
pub const DOMAIN_NULLIFIER: &[u8] = b"msingi:nullifier:";
pub const DOMAIN_LEAF: &[u8] = b"msingi:leaf:";
pub const DOMAIN_NODE: &[u8] = b"msingi:node:";
pub const DOMAIN_DATA: &[u8] = b"msingi:data:";

fn tagged(domain: &[u8], parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// commitment binding a device key to a blinding factor, `H(tag || pk || r)`
///
/// Computed on the device; the server only ever sees the output. Kept
/// here so tests and tooling can build commitments the way firmware does.
pub fn commitment_hash(pk: &[u8; 64], blinding: &[u8; 32]) -> Hash {
    tagged(DOMAIN_COMMITMENT, &[pk, blinding])
}

/// epoch-scoped nullifier, `H(tag || device_secret || epoch_be32)`
///
/// Also device-side; the server stores what it receives and never
/// reconstructs one.
pub fn nullifier_hash(device_secret: &[u8; 32], epoch: u32) -> Hash {
    tagged(DOMAIN_NULLIFIER, &[device_secret, &epoch.to_be_bytes()])
}

/// leaf-domain hash, shared with the circuit's leaf gadget
pub fn leaf_hash(value: &[u8; 32]) -> Hash {
    tagged(DOMAIN_LEAF, &[value])
}

/// internal tree node, `H(tag || left || right)`
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    tagged(DOMAIN_NODE, &[left, right])
}

/// sensor payload digest, `H(tag || le_bytes(sensor))`
pub fn data_hash(sensor_le: &[u8]) -> Hash {
    tagged(DOMAIN_DATA, &[sensor_le])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_separate() {
        let v = [7u8; 32];
        let as_leaf = leaf_hash(&v);
        let as_node = node_hash(&v, &v);
        let as_data = data_hash(&v);
        assert_ne!(as_leaf, as_node);
        assert_ne!(as_leaf, as_data);
        assert_ne!(as_node, as_data);
    }

    #[test]
    fn node_hash_order_matters() {
        let left = [1u8; 32];
        let right = [2u8; 32];
        assert_ne!(node_hash(&left, &right), node_hash(&right, &left));
    }

    #[test]
    fn nullifier_varies_per_epoch() {
        let secret = [9u8; 32];
        assert_ne!(nullifier_hash(&secret, 100), nullifier_hash(&secret, 101));
    }
}
