//! nullifiers and contribution rewards
//!
//! A nullifier is an epoch-scoped one-shot tag produced on the device
//! from its secret; the server only ever compares byte values. Spending
//! one marks the device's contribution for that epoch as claimed.

use crate::hash::{nullifier_hash, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte epoch-scoped spend tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nullifier(pub Hash);

impl Nullifier {
    pub fn from_bytes(bytes: Hash) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> Hash {
        self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        crate::parse_hex32(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// derive a nullifier the way device firmware does; the server never
    /// calls this outside tests and mock proving
    pub fn derive(device_secret: &[u8; 32], epoch: u32) -> Self {
        Self(nullifier_hash(device_secret, epoch))
    }
}

impl fmt::Debug for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nullifier({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

/// how a spend entered the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendMode {
    /// packet pipeline, prover-assisted
    Auto,
    /// explicit claim through the API
    Manual,
}

/// contribution reward tiers, in micro-units of the settlement asset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardTier {
    High,
    Medium,
    Low,
}

impl RewardTier {
    /// tier value in micro-units (1 unit = 1_000_000 micro)
    pub fn micro(&self) -> u64 {
        match self {
            RewardTier::High => 100_000,   // 0.1
            RewardTier::Medium => 50_000,  // 0.05
            RewardTier::Low => 20_000,     // 0.02
        }
    }
}

/// per-device consistency summary driving tier selection
///
/// Collection of this history is a future component; nullifiers are
/// unlinkable across epochs, so today every claim arrives with the
/// empty history and earns the baseline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClaimHistory {
    /// consecutive epochs with an accepted claim
    pub consecutive_epochs: u32,
    /// epochs missed inside the observation window
    pub missed_epochs: u32,
}

/// pure tier policy over observable history
pub fn tier_for(history: &ClaimHistory) -> RewardTier {
    if history.consecutive_epochs >= 30 && history.missed_epochs == 0 {
        RewardTier::High
    } else if history.missed_epochs > history.consecutive_epochs {
        RewardTier::Low
    } else {
        RewardTier::Medium
    }
}

/// one accepted spend, as persisted in the store log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    #[serde(with = "crate::hex32")]
    pub n: Hash,
    pub e: u64,
    pub t_ms: u64,
    pub reward_micro: u64,
    #[serde(with = "crate::hex32")]
    pub data_hash: Hash,
    pub mode: SpendMode,
}
