//! packet verification (BRACE membership + ACR input assembly)
//!
//! Checks run in order and stop at the first failure: freshness,
//! sensor ranges, commitment membership, then witness assembly. The
//! P-256 signature is never checked here; the circuit proves it, so
//! the raw bytes pass through untouched.

use crate::clock::Clock;
use crate::error::Reject;
use crate::events::{EventHub, EventKind};
use crate::registry::RegistryService;
use msingi_core::hash::data_hash;
use msingi_core::{Hash, LoraPacket, MerkleProof};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

/// sliding window for the auto-enroll rate limit
pub const ENROLL_WINDOW_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollPolicy {
    /// unknown commitments are rejected
    Strict,
    /// unknown commitments are registered on sight, rate-limited per source
    AutoEnroll,
}

/// a packet that passed every check, ready for proof dispatch
#[derive(Debug, Clone)]
pub struct VerifiedPacket {
    pub packet: LoraPacket,
    pub proof: MerkleProof,
    pub epoch: u64,
    pub data_hash: Hash,
}

pub struct PacketVerifier {
    registry: RegistryService,
    clock: Clock,
    hub: EventHub,
    skew_s: u64,
    policy: EnrollPolicy,
    per_src_per_min: u32,
    /// per-source timestamps (s) of recent fresh enrollments
    enroll_windows: Mutex<HashMap<u16, VecDeque<u64>>>,
}

impl PacketVerifier {
    pub fn new(
        registry: RegistryService,
        clock: Clock,
        hub: EventHub,
        skew_s: u64,
        policy: EnrollPolicy,
        per_src_per_min: u32,
    ) -> Self {
        Self {
            registry,
            clock,
            hub,
            skew_s,
            policy,
            per_src_per_min,
            enroll_windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn verify(&self, packet: LoraPacket) -> Result<VerifiedPacket, Reject> {
        // freshness: device clocks drift both ways
        let now_s = self.clock.now_s() as i64;
        let age_s = now_s - packet.timestamp_s as i64;
        if age_s.unsigned_abs() > self.skew_s {
            return Err(Reject::Stale {
                age_s,
                max_skew_s: self.skew_s,
            });
        }

        packet.sensor.validate()?;

        if !self.registry.contains(&packet.commitment) {
            match self.policy {
                EnrollPolicy::Strict => return Err(Reject::Unregistered),
                EnrollPolicy::AutoEnroll => self.enroll(&packet)?,
            }
        }

        let proof = self.registry.proof_for(&packet.commitment)?;
        let epoch = self.clock.epoch_of(packet.timestamp_s as u64);
        let data_hash = data_hash(&packet.sensor.to_le_bytes());

        Ok(VerifiedPacket {
            packet,
            proof,
            epoch,
            data_hash,
        })
    }

    /// register an unknown commitment, spam-guarded per source address
    fn enroll(&self, packet: &LoraPacket) -> Result<(), Reject> {
        let now_s = self.clock.now_s();
        {
            let mut windows = self.enroll_windows.lock().unwrap();
            let window = windows.entry(packet.src_addr).or_default();
            while window
                .front()
                .is_some_and(|t| t + ENROLL_WINDOW_S <= now_s)
            {
                window.pop_front();
            }
            if window.len() >= self.per_src_per_min as usize {
                debug!(
                    "enrollment over limit for source {} ({} in window)",
                    packet.src_addr,
                    window.len()
                );
                return Err(Reject::EnrollmentRateLimited {
                    src_addr: packet.src_addr,
                });
            }
            window.push_back(now_s);
        }

        let (outcome, root, leaf_count) = self.registry.insert(packet.commitment)?;
        if outcome.is_fresh() {
            info!(
                "auto-enrolled {} at leaf {}",
                packet.commitment,
                outcome.leaf_index()
            );
            self.hub.publish(EventKind::RegistryUpdated {
                merkle_root: hex::encode(root),
                leaf_count,
            });
        }
        Ok(())
    }
}
