//! shared observable counters for /status and the event stream

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// smoothing factor for the rolling RSSI average
pub const RSSI_EWMA_ALPHA: f64 = 0.1;

#[derive(Default)]
pub struct Counters {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub proofs_generated: AtomicU64,
    pub nullifiers_spent: AtomicU64,
    /// millisecond timestamp of the last submitted proof, 0 = never
    pub last_proof_ms: AtomicU64,
    avg_rssi_bits: AtomicU64,
    rssi_seen: AtomicBool,
}

impl Counters {
    pub fn record_rssi(&self, rssi: i16) {
        let sample = rssi as f64;
        if !self.rssi_seen.swap(true, Ordering::AcqRel) {
            self.avg_rssi_bits
                .store(sample.to_bits(), Ordering::Release);
            return;
        }
        let mut current = self.avg_rssi_bits.load(Ordering::Acquire);
        loop {
            let avg = f64::from_bits(current);
            let next = avg * (1.0 - RSSI_EWMA_ALPHA) + sample * RSSI_EWMA_ALPHA;
            match self.avg_rssi_bits.compare_exchange(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn avg_rssi(&self) -> Option<f64> {
        if self.rssi_seen.load(Ordering::Acquire) {
            Some(f64::from_bits(self.avg_rssi_bits.load(Ordering::Acquire)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_tracks_samples() {
        let counters = Counters::default();
        assert_eq!(counters.avg_rssi(), None);

        counters.record_rssi(-40);
        assert_eq!(counters.avg_rssi(), Some(-40.0));

        counters.record_rssi(-60);
        let expected = -40.0 * 0.9 + -60.0 * 0.1;
        assert!((counters.avg_rssi().unwrap() - expected).abs() < 1e-9);
    }
}
