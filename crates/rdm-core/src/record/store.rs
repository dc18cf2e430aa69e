//! Record Store: one `JobRecord` per file in a flat directory.
//!
//! Mirrors the teacher crate's SQLite-backed job table in spirit (a
//! `list`/`get`/`upsert`/`remove` surface) but re-platformed onto the flat
//! per-job file layout this system persists to: `<directory>/<job_id>.json`.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};

use super::types::JobRecord;

/// How long a failed parse is left alone before `list_records` retries it.
const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default bound on in-flight parses during `list_records`.
const DEFAULT_CONCURRENCY: usize = 50;

pub struct RecordStore {
    directory: PathBuf,
    cache: RwLock<HashMap<String, JobRecord>>,
    failures: Mutex<HashMap<String, Instant>>,
    concurrency: Arc<Semaphore>,
}

impl RecordStore {
    /// Opens (creating if needed) a Record Store rooted at `directory`, with
    /// up to `concurrency` records parsed in parallel during `list_records`.
    /// Clamped to the `[8, 64]` range the spec requires.
    pub fn new(directory: impl Into<PathBuf>, concurrency: usize) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create record directory: {}", directory.display()))?;
        Ok(Self {
            directory,
            cache: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            concurrency: Arc::new(Semaphore::new(concurrency.clamp(8, 64))),
        })
    }

    pub fn with_default_concurrency(directory: impl Into<PathBuf>) -> Result<Self> {
        Self::new(directory, DEFAULT_CONCURRENCY)
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.directory.join(format!("{job_id}.json"))
    }

    /// True when `path` is a quarantined/partial write that should be
    /// skipped rather than treated as a record: extension `tmp`, or a stem
    /// ending in `.temp`.
    fn is_ignored(path: &Path) -> bool {
        if path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("tmp"))
            .unwrap_or(false)
        {
            return true;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.ends_with(".temp"))
            .unwrap_or(false)
    }

    /// Lists every valid record in the directory. Parses are bounded by the
    /// store's concurrency semaphore; files already in the failure map are
    /// skipped until `FAILURE_RETRY_DELAY` has elapsed since the last
    /// failure. A structurally unrecoverable parse error (serde type
    /// mismatch) deletes the file; other I/O errors just record the
    /// failure for later retry.
    pub async fn list_records(&self) -> Result<Vec<JobRecord>> {
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .with_context(|| format!("failed to read record directory: {}", self.directory.display()))?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() || Self::is_ignored(&path) {
                continue;
            }
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            candidates.push(path);
        }

        let mut tasks = Vec::with_capacity(candidates.len());
        for path in candidates {
            let job_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            {
                let failures = self.failures.lock().await;
                if let Some(&last) = failures.get(&job_id) {
                    if last.elapsed() < FAILURE_RETRY_DELAY {
                        continue;
                    }
                }
            }

            let permit = Arc::clone(&self.concurrency);
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let result = tokio::fs::read(&path).await;
                (job_id, path, result)
            }));
        }

        let mut out = Vec::new();
        for task in tasks {
            let (job_id, path, read_result) = task.await.context("record parse task panicked")?;
            match read_result {
                Ok(bytes) => match serde_json::from_slice::<JobRecord>(&bytes) {
                    Ok(record) => {
                        self.failures.lock().await.remove(&job_id);
                        self.cache.write().await.insert(job_id, record.clone());
                        out.push(record);
                    }
                    Err(e) if e.is_data() || e.classify() == serde_json::error::Category::Syntax => {
                        tracing::warn!(job_id, error = %e, "record structurally corrupt, deleting");
                        let _ = tokio::fs::remove_file(&path).await;
                        self.failures.lock().await.remove(&job_id);
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "record parse failed, will retry");
                        self.failures.lock().await.insert(job_id, Instant::now());
                    }
                },
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "record read failed, will retry");
                    self.failures.lock().await.insert(job_id, Instant::now());
                }
            }
        }

        Ok(out)
    }

    /// Loads one record by id, consulting the cache first.
    pub async fn load(&self, job_id: &str) -> Result<JobRecord> {
        if let Some(r) = self.cache.read().await.get(job_id) {
            return Ok(r.clone());
        }
        let path = self.path_for(job_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read record: {}", path.display()))?;
        let record: JobRecord =
            serde_json::from_slice(&bytes).with_context(|| format!("corrupt record: {job_id}"))?;
        self.cache.write().await.insert(job_id.to_string(), record.clone());
        Ok(record)
    }

    /// Serializes `record` to its file, bumping its generation counter
    /// first so the Snapshot Merger can detect it changed.
    pub async fn save(&self, record: &mut JobRecord) -> Result<()> {
        record.generation += 1;
        let path = self.path_for(&record.job_id);
        let bytes = serde_json::to_vec_pretty(record).context("failed to serialize record")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write record: {}", path.display()))?;
        self.cache
            .write()
            .await
            .insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    /// Removes both the record file and any cached entry.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let path = self.path_for(job_id);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to delete record: {}", path.display()))?;
        }
        self.cache.write().await.remove(job_id);
        self.failures.lock().await.remove(job_id);
        Ok(())
    }

    /// Reconciles the in-memory cache against the directory: drops entries
    /// whose files have disappeared, and drops failed entries whose retry
    /// delay has elapsed so the next access reloads them from disk.
    pub async fn validate(&self) -> Result<()> {
        let mut cache = self.cache.write().await;
        let mut gone = Vec::new();
        for job_id in cache.keys() {
            if !self.path_for(job_id).exists() {
                gone.push(job_id.clone());
            }
        }
        for job_id in gone {
            cache.remove(&job_id);
        }
        drop(cache);

        let mut failures = self.failures.lock().await;
        failures.retain(|_, last| last.elapsed() < FAILURE_RETRY_DELAY);
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
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
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path(), 8).unwrap();
        let mut r = sample("job-a");
        store.save(&mut r).await.unwrap();
        assert_eq!(r.generation, 1);
        let loaded = store.load("job-a").await.unwrap();
        assert_eq!(loaded.job_id, "job-a");
        assert_eq!(loaded.generation, 1);
    }

    #[tokio::test]
    async fn list_records_ignores_tmp_and_temp_suffixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path(), 8).unwrap();
        tokio::fs::write(dir.path().join("scratch.tmp"), b"garbage")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("job-b.temp.json"), b"garbage")
            .await
            .unwrap();
        let mut r = sample("job-c");
        store.save(&mut r).await.unwrap();

        let records = store.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id, "job-c");
    }

    #[tokio::test]
    async fn list_records_quarantines_structurally_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path(), 8).unwrap();
        let bad_path = dir.path().join("job-bad.json");
        tokio::fs::write(&bad_path, b"{\"job_id\": 12345}")
            .await
            .unwrap();

        let records = store.list_records().await.unwrap();
        assert!(records.is_empty());
        assert!(!bad_path.exists());
    }

    #[tokio::test]
    async fn delete_removes_file_and_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path(), 8).unwrap();
        let mut r = sample("job-d");
        store.save(&mut r).await.unwrap();
        store.delete("job-d").await.unwrap();
        assert!(store.load("job-d").await.is_err());
    }

    #[tokio::test]
    async fn validate_drops_cache_entries_for_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path(), 8).unwrap();
        let mut r = sample("job-e");
        store.save(&mut r).await.unwrap();
        tokio::fs::remove_file(store.path_for("job-e")).await.unwrap();
        store.validate().await.unwrap();
        assert!(store.load("job-e").await.is_err());
    }
}
