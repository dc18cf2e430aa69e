//! `JobRecord`: the durable unit persisted by the Record Store.

use serde::{Deserialize, Serialize};

use crate::config::GlobalSettings;

/// High-level job status, as carried in `JobRecord::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Downloading,
    /// Also referred to as "CLOSE" in the source this was distilled from.
    Paused,
    Complete,
}

/// The durable representation of one download job. Owned exclusively by its
/// Job Engine while `status == Downloading`; owned by the Scheduler
/// otherwise. A `job_id` appears in at most one of the Scheduler's `active`
/// or `finished` collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,

    // Source
    pub file_url: String,
    pub referrer: Option<String>,
    pub cookie_string: Option<String>,
    pub content_disposition: Option<String>,
    pub from_browser: bool,

    // Target
    pub destination_path: String,
    pub file_name: String,
    pub file_directory: String,

    // Server facts
    pub total_size: i64,
    pub size_known: bool,
    pub resume_supported: bool,
    pub multipart_supported: bool,
    pub checksum: Option<String>,

    // Plan
    pub thread_count: usize,
    pub part_start: Vec<u64>,
    pub part_end: Vec<u64>,
    pub part_chunk_size: Vec<u64>,
    pub part_downloaded: Vec<u64>,
    pub part_percent: Vec<f64>,

    // Aggregate progress
    pub downloaded_bytes: u64,
    pub progress_percent: f64,
    pub average_speed: f64,
    pub realtime_speed: f64,
    pub max_speed: f64,
    pub time_spent_ms: u64,
    pub remaining_time_s: f64,
    pub last_modified_ms: i64,
    pub start_time_ms: i64,

    // State
    pub status: JobStatus,
    pub is_running: bool,
    pub is_complete: bool,
    pub is_removed: bool,
    pub is_deleted: bool,
    pub is_waiting_for_network: bool,
    pub is_url_expired: bool,
    pub is_dest_missing: bool,
    pub failed_to_access_file: bool,
    pub total_connection_retries: u32,
    pub user_status_text: String,

    // Configuration snapshot
    pub settings: GlobalSettings,

    /// Monotonic counter bumped on every `save()`. Used by the Snapshot
    /// Merger as the freshness oracle instead of trusting file mtimes,
    /// which are fragile against clock skew.
    #[serde(default)]
    pub generation: u64,
}

/// Derives a job id from the URL and admission time. Not a security
/// boundary, just a stable, collision-resistant filename stem for the
/// Record Store.
pub fn generate_job_id(file_url: &str, now_ms: i64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(file_url.as_bytes());
    hasher.update(now_ms.to_le_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

impl JobRecord {
    /// Constructs a freshly admitted record: `status = Waiting`, zeroed
    /// progress, single-part plan pending the URL Probe.
    pub fn new_waiting(
        job_id: String,
        file_url: String,
        destination_path: String,
        file_name: String,
        file_directory: String,
        settings: GlobalSettings,
        now_ms: i64,
    ) -> Self {
        JobRecord {
            job_id,
            file_url,
            referrer: None,
            cookie_string: None,
            content_disposition: None,
            from_browser: false,
            destination_path,
            file_name,
            file_directory,
            total_size: -1,
            size_known: false,
            resume_supported: false,
            multipart_supported: false,
            checksum: None,
            thread_count: 1,
            part_start: Vec::new(),
            part_end: Vec::new(),
            part_chunk_size: Vec::new(),
            part_downloaded: Vec::new(),
            part_percent: Vec::new(),
            downloaded_bytes: 0,
            progress_percent: 0.0,
            average_speed: 0.0,
            realtime_speed: 0.0,
            max_speed: 0.0,
            time_spent_ms: 0,
            remaining_time_s: 0.0,
            last_modified_ms: now_ms,
            start_time_ms: now_ms,
            status: JobStatus::Waiting,
            is_running: false,
            is_complete: false,
            is_removed: false,
            is_deleted: false,
            is_waiting_for_network: false,
            is_url_expired: false,
            is_dest_missing: false,
            failed_to_access_file: false,
            total_connection_retries: 0,
            user_status_text: String::new(),
            settings,
            generation: 0,
        }
    }

    /// Recomputes `downloaded_bytes` from the per-part counters and the
    /// derived `progress_percent`. Call after any part progress mutation;
    /// keeps the `downloaded_bytes = Σ part_downloaded[i]` invariant.
    pub fn recompute_aggregate_progress(&mut self) {
        self.downloaded_bytes = self.part_downloaded.iter().sum();
        for (i, pct) in self.part_percent.iter_mut().enumerate() {
            let chunk = self.part_chunk_size.get(i).copied().unwrap_or(0);
            *pct = if chunk == 0 {
                100.0
            } else {
                (self.part_downloaded[i] as f64 / chunk as f64) * 100.0
            };
        }
        self.progress_percent = if self.total_size > 0 {
            (self.downloaded_bytes as f64 / self.total_size as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    /// True when every part has downloaded its full chunk size.
    pub fn all_parts_complete(&self) -> bool {
        !self.part_downloaded.is_empty()
            && self
                .part_downloaded
                .iter()
                .zip(self.part_chunk_size.iter())
                .all(|(d, c)| d >= c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobRecord {
        JobRecord::new_waiting(
            "job-1".into(),
            "https://example.com/f.bin".into(),
            "/tmp/f.bin".into(),
            "f.bin".into(),
            "/tmp".into(),
            GlobalSettings::default(),
            0,
        )
    }

    #[test]
    fn recompute_aggregate_sums_parts() {
        let mut r = sample();
        r.total_size = 300;
        r.part_chunk_size = vec![100, 100, 100];
        r.part_downloaded = vec![100, 50, 0];
        r.part_percent = vec![0.0, 0.0, 0.0];
        r.recompute_aggregate_progress();
        assert_eq!(r.downloaded_bytes, 150);
        assert!((r.progress_percent - 50.0).abs() < 1e-9);
        assert!((r.part_percent[0] - 100.0).abs() < 1e-9);
        assert!((r.part_percent[1] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn all_parts_complete_requires_every_part_full() {
        let mut r = sample();
        r.part_chunk_size = vec![10, 10];
        r.part_downloaded = vec![10, 9];
        assert!(!r.all_parts_complete());
        r.part_downloaded = vec![10, 10];
        assert!(r.all_parts_complete());
    }

    #[test]
    fn all_parts_complete_false_when_no_parts_yet() {
        let r = sample();
        assert!(!r.all_parts_complete());
    }

    #[test]
    fn generate_job_id_is_stable_and_distinguishes_by_time() {
        let a = generate_job_id("https://example.com/f.bin", 1000);
        let b = generate_job_id("https://example.com/f.bin", 1000);
        let c = generate_job_id("https://example.com/f.bin", 1001);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
