//! msingi-core - domain types for the farmer-owned proof server
//!
//! Everything in here is pure: domain-separated hashing, the append-only
//! commitment registry (a fixed-depth binary merkle tree), nullifier and
//! reward types, epoch arithmetic, and LoRa telemetry frame parsing.
//! The daemon crate wires these into I/O.

pub mod commitment;
pub mod epoch;
pub mod hash;
pub mod merkle;
pub mod nullifier;
pub mod packet;

pub use commitment::Commitment;
pub use hash::Hash;
pub use merkle::{Inserted, MerkleError, MerkleProof, MerkleRegistry};
pub use nullifier::{ClaimHistory, Nullifier, RewardTier, SpendMode, SpendRecord};
pub use packet::{FrameError, LoraPacket, SensorRangeError, SensorReading};

/// serde helpers for 32-byte values encoded as lowercase hex strings
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes of hex"))
    }
}

/// decode a hex string into a fixed 32-byte array
pub fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}
