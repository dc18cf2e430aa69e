//! Snapshot Merger: periodically folds all per-job records into one binary
//! blob so cold start can skip parsing hundreds of individual files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::record::{JobRecord, RecordStore};

/// Default filename for the consolidated snapshot, under the app's private
/// state directory.
pub const SNAPSHOT_FILE_NAME: &str = "merged_data_binary.dat";

#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    records: Vec<JobRecord>,
}

/// Outcome of a single merger tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was already in flight; this one was skipped.
    AlreadyRunning,
    /// No record was newer than the snapshot; nothing to do.
    UpToDate,
    /// At least one record was newer; the snapshot was rebuilt.
    Rebuilt,
}

/// Single-threaded background loop, guarded by an atomic run-flag so ticks
/// never overlap. Reads the Record Store's directory and writes the
/// consolidated snapshot file used to accelerate the next cold start.
pub struct SnapshotMerger {
    snapshot_path: PathBuf,
    running: Arc<AtomicBool>,
    last_generations: std::sync::Mutex<HashMap<String, u64>>,
}

impl SnapshotMerger {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            running: Arc::new(AtomicBool::new(false)),
            last_generations: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn default_path_under(state_dir: &Path) -> PathBuf {
        state_dir.join(SNAPSHOT_FILE_NAME)
    }

    /// Runs one tick: compare the mtime of every per-job record file
    /// against the snapshot file's mtime; rebuild on any record being
    /// newer, otherwise do nothing.
    pub async fn tick(&self, store: &RecordStore) -> Result<TickOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickOutcome::AlreadyRunning);
        }
        let result = self.tick_inner(store).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn tick_inner(&self, store: &RecordStore) -> Result<TickOutcome> {
        let snapshot_mtime = match tokio::fs::metadata(&self.snapshot_path).await {
            Ok(meta) => Some(meta.modified().context("snapshot mtime unavailable")?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("stat snapshot file"),
        };

        let mut any_newer = snapshot_mtime.is_none();
        let mut entries = tokio::fs::read_dir(store.directory()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let meta = entry.metadata().await?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(snap_mtime) = snapshot_mtime {
                if mtime > snap_mtime {
                    any_newer = true;
                }
            }
        }

        if !any_newer {
            return Ok(TickOutcome::UpToDate);
        }

        let records = store.list_records().await.context("list records for snapshot")?;
        self.assert_generations_monotonic(&records);

        let blob = SnapshotBlob { records };
        let bytes = bincode::serialize(&blob).context("serialize snapshot")?;
        if let Some(parent) = self.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.snapshot_path, bytes)
            .await
            .with_context(|| format!("write snapshot: {}", self.snapshot_path.display()))?;
        Ok(TickOutcome::Rebuilt)
    }

    /// Corruption sanity check independent of mtime: a job's generation
    /// counter should never decrease between ticks.
    fn assert_generations_monotonic(&self, records: &[JobRecord]) {
        let mut last = self.last_generations.lock().unwrap();
        for r in records {
            if let Some(&prev) = last.get(&r.job_id) {
                if r.generation < prev {
                    tracing::warn!(job_id = %r.job_id, prev, now = r.generation, "record generation went backwards");
                }
            }
            last.insert(r.job_id.clone(), r.generation);
        }
    }

    /// Cold-start load: returns `Some(records)` only when the snapshot
    /// exists and every per-job record's mtime is `<=` the snapshot's
    /// mtime. Otherwise returns `None` so the caller falls back to the
    /// Record Store. Decode failure is treated the same as "absent".
    pub async fn load_snapshot(&self, store: &RecordStore) -> Option<Vec<JobRecord>> {
        let snapshot_mtime = match tokio::fs::metadata(&self.snapshot_path).await {
            Ok(meta) => meta.modified().ok()?,
            Err(_) => return None,
        };

        let mut entries = tokio::fs::read_dir(store.directory()).await.ok()?;
        while let Some(entry) = entries.next_entry().await.ok().flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let meta = entry.metadata().await.ok()?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if mtime > snapshot_mtime {
                tracing::debug!("snapshot stale, falling back to record store");
                return None;
            }
        }

        let bytes = tokio::fs::read(&self.snapshot_path).await.ok()?;
        match bincode::deserialize::<SnapshotBlob>(&bytes) {
            Ok(blob) => Some(blob.records),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot decode failed, treating as absent");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalSettings;

    fn sample(job_id: &str) -> JobRecord {
        JobRecord::new_waiting(
            job_id.into(),
            "https://example.com/f.bin".into(),
            "/tmp/f.bin".into(),
            "f.bin".into(),
            "/tmp".into(),
            GlobalSettings::default(),
            0,
        )
    }

    #[tokio::test]
    async fn tick_rebuilds_when_snapshot_absent_then_is_up_to_date() {
        let record_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(record_dir.path(), 8).unwrap();
        let mut r = sample("job-1");
        store.save(&mut r).await.unwrap();

        let snap_dir = tempfile::tempdir().unwrap();
        let merger = SnapshotMerger::new(snap_dir.path().join("snap.dat"));

        let first = merger.tick(&store).await.unwrap();
        assert_eq!(first, TickOutcome::Rebuilt);

        let second = merger.tick(&store).await.unwrap();
        assert_eq!(second, TickOutcome::UpToDate);
    }

    #[tokio::test]
    async fn touching_a_record_makes_next_tick_rebuild() {
        let record_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(record_dir.path(), 8).unwrap();
        let mut r = sample("job-1");
        store.save(&mut r).await.unwrap();

        let snap_dir = tempfile::tempdir().unwrap();
        let merger = SnapshotMerger::new(snap_dir.path().join("snap.dat"));
        merger.tick(&store).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.save(&mut r).await.unwrap();

        let outcome = merger.tick(&store).await.unwrap();
        assert_eq!(outcome, TickOutcome::Rebuilt);
    }

    #[tokio::test]
    async fn load_snapshot_round_trips_when_fresh() {
        let record_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(record_dir.path(), 8).unwrap();
        let mut r = sample("job-1");
        store.save(&mut r).await.unwrap();

        let snap_dir = tempfile::tempdir().unwrap();
        let merger = SnapshotMerger::new(snap_dir.path().join("snap.dat"));
        merger.tick(&store).await.unwrap();

        let loaded = merger.load_snapshot(&store).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].job_id, "job-1");
    }

    #[tokio::test]
    async fn load_snapshot_none_when_record_newer_than_snapshot() {
        let record_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(record_dir.path(), 8).unwrap();
        let mut r = sample("job-1");
        store.save(&mut r).await.unwrap();

        let snap_dir = tempfile::tempdir().unwrap();
        let merger = SnapshotMerger::new(snap_dir.path().join("snap.dat"));
        merger.tick(&store).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.save(&mut r).await.unwrap();

        assert!(merger.load_snapshot(&store).await.is_none());
    }

    #[tokio::test]
    async fn load_snapshot_none_when_absent() {
        let record_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(record_dir.path(), 8).unwrap();
        let snap_dir = tempfile::tempdir().unwrap();
        let merger = SnapshotMerger::new(snap_dir.path().join("missing.dat"));
        assert!(merger.load_snapshot(&store).await.is_none());
    }
}
