//! wall-clock and epoch source
//!
//! One conversion site between milliseconds and seconds lives here.
//! The clock is clamped monotonic within a run; a system clock that has
//! gone backwards relative to restored state is a startup-fatal error,
//! never silently absorbed.

use crate::error::ClockRollback;
use msingi_core::epoch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
enum Source {
    System,
    /// test source; advanced explicitly
    Manual(Arc<AtomicU64>),
}

#[derive(Clone)]
pub struct Clock {
    epoch_len_s: u64,
    source: Source,
    /// highest value handed out so far; now() never goes below it
    last_ms: Arc<AtomicU64>,
}

impl Clock {
    pub fn system(epoch_len_s: u64) -> Self {
        Self {
            epoch_len_s,
            source: Source::System,
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// fixed-start clock for tests and the replay transport
    pub fn manual(start_ms: u64, epoch_len_s: u64) -> Self {
        Self {
            epoch_len_s,
            source: Source::Manual(Arc::new(AtomicU64::new(start_ms))),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// advance a manual clock; no-op on the system source
    pub fn advance_ms(&self, delta: u64) {
        if let Source::Manual(ms) = &self.source {
            ms.fetch_add(delta, Ordering::SeqCst);
        }
    }

    pub fn now_ms(&self) -> u64 {
        let raw = match &self.source {
            Source::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Source::Manual(ms) => ms.load(Ordering::SeqCst),
        };
        let prev = self.last_ms.fetch_max(raw, Ordering::AcqRel);
        raw.max(prev)
    }

    pub fn now_s(&self) -> u64 {
        self.now_ms() / 1000
    }

    pub fn epoch_len_s(&self) -> u64 {
        self.epoch_len_s
    }

    pub fn epoch_of(&self, t_s: u64) -> u64 {
        epoch::epoch_of(t_s, self.epoch_len_s)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch_of(self.now_s())
    }

    /// restored state must not be stamped in the future
    pub fn check_restore(&self, latest_stamped_ms: Option<u64>) -> Result<(), ClockRollback> {
        let now_ms = self.now_ms();
        match latest_stamped_ms {
            Some(stamped_ms) if stamped_ms > now_ms => Err(ClockRollback { stamped_ms, now_ms }),
            _ => Ok(()),
        }
    }
}
