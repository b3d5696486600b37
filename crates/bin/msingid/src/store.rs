//! persistent nullifier store
//!
//! An in-memory `(nullifier, epoch)` index over an append-only JSONL
//! log. A spend is acknowledged only after its record is on disk; a
//! failed write leaves the index untouched and the caller sees a
//! storage error. Compaction rewrites a fresh file and renames over
//! the old one.

use crate::clock::Clock;
use crate::error::SpendError;
use msingi_core::epoch::in_claim_window;
use msingi_core::nullifier::{tier_for, ClaimHistory, SpendMode, SpendRecord};
use msingi_core::{Hash, Nullifier, RewardTier};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

struct Inner {
    index: HashMap<(Nullifier, u64), SpendRecord>,
    file: File,
}

pub struct NullifierStore {
    inner: RwLock<Inner>,
    clock: Clock,
    max_lag: u64,
    max_lead: u64,
    path: PathBuf,
}

impl NullifierStore {
    /// open the log, replaying every record into the index
    ///
    /// Returns the store and the latest `spent_at` stamp seen, for the
    /// startup clock-rollback check. A record that fails to parse is
    /// corrupt state and refuses startup, with one exception: a final
    /// line without its newline terminator is a crash remnant from an
    /// interrupted append and is dropped with a warning.
    pub fn open(
        path: &Path,
        clock: Clock,
        max_lag: u64,
        max_lead: u64,
    ) -> Result<(Self, Option<u64>), SpendError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut index = HashMap::new();
        let mut latest_ms = None;
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let ends_complete = content.is_empty() || content.ends_with('\n');
            let lines: Vec<&str> = content.lines().collect();
            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SpendRecord>(line) {
                    Ok(record) => {
                        latest_ms = Some(latest_ms.map_or(record.t_ms, |m: u64| m.max(record.t_ms)));
                        index.insert((Nullifier(record.n), record.e), record);
                    }
                    Err(e) if i == lines.len() - 1 && !ends_complete => {
                        warn!("dropping truncated trailing record in {}", path.display());
                        let _ = e;
                    }
                    Err(e) => {
                        return Err(SpendError::Corrupt {
                            line: i + 1,
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(
            "nullifier store open: {} entries from {}",
            index.len(),
            path.display()
        );

        Ok((
            Self {
                inner: RwLock::new(Inner { index, file }),
                clock,
                max_lag,
                max_lead,
                path: path.to_path_buf(),
            },
            latest_ms,
        ))
    }

    /// admit a spend: freshness window, replay check, durable append
    pub fn try_spend(
        &self,
        nullifier: Nullifier,
        epoch: u64,
        data_hash: Hash,
        mode: SpendMode,
    ) -> Result<RewardTier, SpendError> {
        let current = self.clock.current_epoch();
        if !in_claim_window(epoch, current, self.max_lag, self.max_lead) {
            return Err(SpendError::EpochOutOfWindow {
                epoch,
                min: current.saturating_sub(self.max_lag),
                max: current.saturating_add(self.max_lead),
            });
        }

        let mut inner = self.inner.write().unwrap();
        if inner.index.contains_key(&(nullifier, epoch)) {
            return Err(SpendError::AlreadySpent { epoch });
        }

        // tier history collection is a future component; today every
        // claim carries the empty history
        let tier = tier_for(&ClaimHistory::default());
        let record = SpendRecord {
            n: nullifier.to_bytes(),
            e: epoch,
            t_ms: self.clock.now_ms(),
            reward_micro: tier.micro(),
            data_hash,
            mode,
        };

        // disk before memory: an unwritten spend must stay spendable
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| SpendError::Storage(std::io::Error::other(e)))?;
        line.push(b'\n');
        inner.file.write_all(&line)?;
        inner.file.sync_data()?;

        inner.index.insert((nullifier, epoch), record);
        debug!("spent {} for epoch {} ({:?})", nullifier, epoch, mode);
        Ok(tier)
    }

    pub fn is_spent(&self, nullifier: &Nullifier, epoch: u64) -> bool {
        self.inner
            .read()
            .unwrap()
            .index
            .contains_key(&(*nullifier, epoch))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().index.len()
    }

    /// drop entries with `epoch < before_epoch` and compact the log
    pub fn gc(&self, before_epoch: u64) -> Result<usize, SpendError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.index.len();
        inner.index.retain(|(_, epoch), _| *epoch >= before_epoch);
        let removed = before - inner.index.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut records: Vec<&SpendRecord> = inner.index.values().collect();
        records.sort_by_key(|r| (r.t_ms, r.e, r.n));

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            for record in records {
                let mut line = serde_json::to_vec(record)
                    .map_err(|e| SpendError::Storage(std::io::Error::other(e)))?;
                line.push(b'\n');
                out.write_all(&line)?;
            }
            out.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;

        info!("nullifier gc: removed {} entries below epoch {}", removed, before_epoch);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EPOCH_LEN: u64 = 86_400;

    fn clock_at_epoch(epoch: u64) -> Clock {
        Clock::manual(epoch * EPOCH_LEN * 1000, EPOCH_LEN)
    }

    fn open_at_epoch(path: &Path, epoch: u64) -> NullifierStore {
        NullifierStore::open(path, clock_at_epoch(epoch), 1, 0)
            .unwrap()
            .0
    }

    fn n(byte: u8) -> Nullifier {
        Nullifier([byte; 32])
    }

    #[test]
    fn spend_then_replay_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");
        let store = open_at_epoch(&path, 100);

        let tier = store
            .try_spend(n(0x0a), 100, [0x0b; 32], SpendMode::Manual)
            .unwrap();
        assert_eq!(tier, RewardTier::Medium);
        assert!(store.is_spent(&n(0x0a), 100));

        match store.try_spend(n(0x0a), 100, [0x0b; 32], SpendMode::Manual) {
            Err(SpendError::AlreadySpent { epoch: 100 }) => {}
            other => panic!("expected AlreadySpent, got {:?}", other),
        }
    }

    #[test]
    fn replay_rejected_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");

        {
            let store = open_at_epoch(&path, 100);
            store
                .try_spend(n(0x0a), 100, [0x0b; 32], SpendMode::Auto)
                .unwrap();
        }

        let store = open_at_epoch(&path, 100);
        assert_eq!(store.len(), 1);
        assert!(store.is_spent(&n(0x0a), 100));
        assert!(matches!(
            store.try_spend(n(0x0a), 100, [0x0b; 32], SpendMode::Auto),
            Err(SpendError::AlreadySpent { .. })
        ));
    }

    #[test]
    fn epoch_window_enforced_without_touching_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");
        let store = open_at_epoch(&path, 100);

        // lag 1: epoch 99 fine, 98 out; lead 0: 101 out
        assert!(store.try_spend(n(1), 99, [0; 32], SpendMode::Auto).is_ok());
        assert!(matches!(
            store.try_spend(n(2), 98, [0; 32], SpendMode::Auto),
            Err(SpendError::EpochOutOfWindow { epoch: 98, min: 99, max: 100 })
        ));
        assert!(matches!(
            store.try_spend(n(3), 101, [0; 32], SpendMode::Auto),
            Err(SpendError::EpochOutOfWindow { .. })
        ));

        // only the accepted spend reached the log
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn same_nullifier_different_epochs_both_spend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");
        let store = open_at_epoch(&path, 100);

        store.try_spend(n(7), 99, [0; 32], SpendMode::Auto).unwrap();
        store.try_spend(n(7), 100, [0; 32], SpendMode::Auto).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn gc_compacts_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");
        let store = open_at_epoch(&path, 100);

        store.try_spend(n(1), 99, [0; 32], SpendMode::Auto).unwrap();
        store.try_spend(n(2), 100, [0; 32], SpendMode::Auto).unwrap();

        assert_eq!(store.gc(100).unwrap(), 1);
        assert!(!store.is_spent(&n(1), 99));
        assert!(store.is_spent(&n(2), 100));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        // appends still work after the handle swap
        store.try_spend(n(3), 100, [0; 32], SpendMode::Auto).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn corrupt_log_refuses_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");
        std::fs::write(&path, "{ garbage }\n").unwrap();

        match NullifierStore::open(&path, clock_at_epoch(1), 1, 0) {
            Err(SpendError::Corrupt { line: 1, .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_tail_is_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");

        {
            let store = open_at_epoch(&path, 100);
            store.try_spend(n(1), 100, [0; 32], SpendMode::Auto).unwrap();
        }
        // simulate a crash mid-append
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"n":"ab"#);
        std::fs::write(&path, content).unwrap();

        let (store, _) = NullifierStore::open(&path, clock_at_epoch(100), 1, 0).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn latest_stamp_reported_for_rollback_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nullifiers.log");

        let clock = clock_at_epoch(100);
        {
            let (store, none) =
                NullifierStore::open(&path, clock.clone(), 1, 0).unwrap();
            assert_eq!(none, None);
            store.try_spend(n(1), 100, [0; 32], SpendMode::Auto).unwrap();
        }

        let (_, latest) = NullifierStore::open(&path, clock.clone(), 1, 0).unwrap();
        assert_eq!(latest, Some(clock.now_ms()));

        // a clock behind the restored state is a startup-fatal rollback
        let stale_clock = clock_at_epoch(50);
        assert!(stale_clock.check_restore(latest).is_err());
    }
}
