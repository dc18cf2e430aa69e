//! Job Engine (§4.5): owns one job's full lifecycle from admission through
//! completion or pause — probing, partitioning, part worker supervision,
//! progress aggregation, and persistence.

mod speed;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::checksum;
use crate::control::JobControl;
use crate::fetch_head;
use crate::net::NetworkMonitor;
use crate::observer::ObserverBus;
use crate::part_worker::{self, PartOutcome, PartRequest};
use crate::record::{JobRecord, JobStatus, RecordStore};
use crate::segmenter::{self, Part};
use crate::storage::{StorageWriter, StorageWriterBuilder};
use speed::SpeedTracker;

const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// Why the engine stopped running (used by the Scheduler to decide what to
/// do next: leave paused, mark finished, or escalate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Completed,
    Paused(String),
    Deleted,
}

struct RunningPart {
    part: Part,
    downloaded: Arc<AtomicU64>,
    token: Arc<AtomicBool>,
    task: JoinHandle<PartOutcome>,
}

/// Drives one job's record through `DOWNLOADING` until it completes, pauses,
/// or is deleted. Exclusive owner of the record while running, per the
/// single-writer invariant in §5.
pub struct JobEngine {
    record: JobRecord,
    store: Arc<RecordStore>,
    observers: ObserverBus,
    net: Arc<dyn NetworkMonitor>,
    control: Arc<JobControl>,
    job_token: Arc<AtomicBool>,
    parts: Vec<RunningPart>,
    speed: SpeedTracker,
}

impl JobEngine {
    pub fn new(
        record: JobRecord,
        store: Arc<RecordStore>,
        observers: ObserverBus,
        net: Arc<dyn NetworkMonitor>,
        control: Arc<JobControl>,
    ) -> Self {
        let job_token = control.register(&record.job_id);
        Self {
            record,
            store,
            observers,
            net,
            control,
            job_token,
            parts: Vec::new(),
            speed: SpeedTracker::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.record.job_id
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Runs the full lifecycle: initiation (§4.5 steps 1-9) then the 500 ms
    /// progress tick loop until a terminal exit.
    pub async fn run(&mut self) -> Result<EngineExit> {
        if let Some(exit) = self.initiate().await? {
            self.control.unregister(&self.record.job_id);
            return Ok(exit);
        }

        let exit = loop {
            tokio::time::sleep(PROGRESS_TICK).await;
            if let Some(exit) = self.progress_tick().await? {
                break exit;
            }
        };
        self.control.unregister(&self.record.job_id);
        Ok(exit)
    }

    /// Steps 1-9 of §4.5. Returns `Some(exit)` when the job terminates
    /// before any part worker is even launched (missing file, pre-alloc
    /// failure); `None` means parts are running and the tick loop owns it.
    async fn initiate(&mut self) -> Result<Option<EngineExit>> {
        // 1. Mark paused/joining, reset retry counter, persist.
        self.record.status = JobStatus::Paused;
        self.record.user_status_text = "waiting to join".to_string();
        self.record.total_connection_retries = 0;
        self.persist().await?;

        // 2. Resumed job whose destination vanished.
        if self.record.downloaded_bytes > 0 && !std::path::Path::new(&self.record.destination_path).exists() {
            self.record.failed_to_access_file = true;
            return Ok(Some(self.cancel_internal("deleted, paused").await?));
        }

        // 3/4. Auto-resume/auto-remove and redirect resolution are applied
        // by the Scheduler before handing the job to the engine (admission
        // time), so there is nothing further to do here.

        // 5. Probe when size is unknown or trivially small.
        if self.record.total_size <= 1 {
            let custom_headers = self.probe_headers();
            let probe = fetch_head::probe(&self.record.file_url, &custom_headers, &self.record.settings);
            if probe.forbidden {
                self.record.failed_to_access_file = true;
                let reason = probe
                    .error_message
                    .unwrap_or_else(|| "forbidden".to_string());
                return Ok(Some(self.cancel_internal(&reason).await?));
            }
            self.record.total_size = probe.size;
            self.record.size_known = probe.size >= 0;
            self.record.resume_supported = probe.resume_supported;
            self.record.multipart_supported = probe.multipart_supported;
            if self.record.file_name.is_empty() || self.record.file_name == "download.bin" {
                self.record.file_name = probe.filename;
            }
            if !self.record.size_known {
                self.record.thread_count = 1;
            }
        }

        // 6. Partition plan.
        let total = if self.record.size_known && self.record.total_size >= 0 {
            Some(self.record.total_size as u64)
        } else {
            None
        };
        let thread_count = if self.record.multipart_supported {
            self.record.thread_count.max(1)
        } else {
            1
        };
        let plan = segmenter::plan_parts(total, thread_count, segmenter::DEFAULT_ALIGNMENT);
        if self.record.part_start.is_empty() {
            self.record.thread_count = plan.len();
            self.record.part_start = plan.iter().map(|p| p.start).collect();
            self.record.part_end = plan.iter().map(|p| p.end).collect();
            self.record.part_chunk_size = plan.iter().map(|p| p.chunk_size).collect();
            self.record.part_downloaded = vec![0; plan.len()];
            self.record.part_percent = vec![0.0; plan.len()];
        }

        // 7. Pre-allocate destination.
        let dest_exists = std::path::Path::new(&self.record.destination_path).exists();
        if !dest_exists {
            let result = (|| -> Result<StorageWriter> {
                let mut builder = StorageWriterBuilder::create(std::path::Path::new(&self.record.destination_path))?;
                if self.record.multipart_supported && self.record.total_size > 0 {
                    builder.preallocate(self.record.total_size as u64)?;
                }
                Ok(builder.build())
            })();
            if let Err(e) = result {
                self.record.failed_to_access_file = true;
                tracing::warn!(job_id = %self.record.job_id, error = %e, "pre-allocation failed");
                return Ok(Some(self.cancel_internal("storage error").await?));
            }
        } else if !self.record.resume_supported && self.record.thread_count == 1 {
            // Single-threaded restart-from-scratch: the server can't resume,
            // so the partial file must be discarded before we append again.
            if self.record.downloaded_bytes == 0 {
                if let Ok(writer) = StorageWriter::open_existing(std::path::Path::new(&self.record.destination_path)) {
                    let _ = writer.truncate();
                }
            }
        }

        // 8/9. Construct and start Part Workers, start the tick loop (the
        // loop itself lives in `run`).
        self.record.status = JobStatus::Downloading;
        self.record.is_running = true;
        self.record.start_time_ms = self.record.start_time_ms.max(self.record.last_modified_ms);
        self.persist().await?;
        self.spawn_all_parts()?;

        Ok(None)
    }

    fn probe_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(cookie) = &self.record.cookie_string {
            headers.insert("Cookie".to_string(), cookie.clone());
        }
        if let Some(referrer) = &self.record.referrer {
            headers.insert("Referer".to_string(), referrer.clone());
        }
        headers
    }

    fn spawn_all_parts(&mut self) -> Result<()> {
        let writer = if self.record.multipart_supported && self.record.total_size > 0 {
            StorageWriter::open_existing(std::path::Path::new(&self.record.destination_path))
                .context("open destination for part workers")?
        } else {
            StorageWriterBuilder::create(std::path::Path::new(&self.record.destination_path))?.build()
        };

        for i in 0..self.record.part_start.len() {
            let downloaded = self.record.part_downloaded[i];
            let chunk = self.record.part_chunk_size[i];
            if chunk != 0 && downloaded >= chunk {
                continue;
            }
            self.spawn_part(i, &writer, downloaded)?;
        }
        Ok(())
    }

    fn spawn_part(&mut self, index: usize, writer: &StorageWriter, downloaded_so_far: u64) -> Result<()> {
        let part = Part {
            index,
            start: self.record.part_start[index],
            end: self.record.part_end[index],
            chunk_size: self.record.part_chunk_size[index],
        };
        let user_agent = if self.record.from_browser {
            self.record.settings.browser_http_user_agent.clone()
        } else {
            self.record.settings.download_http_user_agent.clone()
        };
        let request = PartRequest {
            url: self.record.file_url.clone(),
            part,
            downloaded_so_far,
            referrer: self.record.referrer.clone(),
            cookie_string: self.record.cookie_string.clone(),
            content_disposition: self.record.content_disposition.clone(),
            from_browser: self.record.from_browser,
            max_recv_speed: match self.record.settings.download_max_network_speed {
                0 => None,
                n => Some(n),
            },
            user_agent,
            follow_redirects: self.record.settings.download_auto_link_redirection,
            timeout_ms: self.record.settings.download_max_http_reading_timeout,
            buffer_size: self.record.settings.download_buffer_size,
        };

        let downloaded_counter = Arc::new(AtomicU64::new(downloaded_so_far));
        let token = Arc::new(AtomicBool::new(false));
        let writer = writer.clone();
        let policy = crate::retry::RetryPolicy::default();
        let progress_counter = Arc::clone(&downloaded_counter);
        let part_token = Arc::clone(&token);

        let task = tokio::task::spawn_blocking(move || {
            part_worker::run_part(&request, &writer, &part_token, &policy, |n| {
                progress_counter.fetch_add(n, Ordering::Relaxed);
            })
        });

        self.parts.push(RunningPart {
            part,
            downloaded: downloaded_counter,
            token,
            task,
        });
        Ok(())
    }

    /// One 500 ms tick (§4.5): aggregate progress, recompute speeds, check
    /// completed/canceled parts, run the network check, persist. Returns
    /// `Some(exit)` when the job has reached a terminal state.
    async fn progress_tick(&mut self) -> Result<Option<EngineExit>> {
        if self.job_token.load(Ordering::Relaxed) {
            return Ok(Some(self.cancel_internal("paused").await?));
        }

        if !self.record.is_waiting_for_network {
            self.record.time_spent_ms += PROGRESS_TICK.as_millis() as u64;
        }

        for (i, running) in self.parts.iter().enumerate() {
            self.record.part_downloaded[i] = running.downloaded.load(Ordering::Relaxed);
        }
        self.record.recompute_aggregate_progress();

        let now = Instant::now();
        self.record.realtime_speed = self.speed.sample(now, self.record.downloaded_bytes);
        self.record.max_speed = self.record.max_speed.max(self.record.realtime_speed);
        self.record.average_speed = if self.record.time_spent_ms > 0 {
            self.record.downloaded_bytes as f64 / (self.record.time_spent_ms as f64 / 1000.0)
        } else {
            0.0
        };
        self.record.remaining_time_s = if self.record.is_waiting_for_network
            || !self.record.size_known
            || self.record.average_speed <= 0.0
        {
            0.0
        } else {
            ((self.record.total_size as f64 - self.record.downloaded_bytes as f64) / self.record.average_speed).max(0.0)
        };

        if let Some(reason) = self.reap_finished_parts().await? {
            self.persist().await?;
            return Ok(Some(reason));
        }

        // Completion reconciliation: a part may have crossed its chunk_size
        // without its task having reported back yet; treat it as done.
        for i in 0..self.record.part_downloaded.len() {
            if self.record.part_chunk_size[i] != 0
                && self.record.part_downloaded[i] >= self.record.part_chunk_size[i]
            {
                self.record.part_percent[i] = 100.0;
            }
        }

        if self.record.all_parts_complete() && self.parts.is_empty() {
            return Ok(Some(self.finish().await?));
        }

        match self.net.check(self.record.settings.download_wifi_only) {
            Some(reason) => {
                self.record.is_waiting_for_network = true;
                self.record.user_status_text = reason.user_text().to_string();
            }
            None => {
                self.record.is_waiting_for_network = false;
            }
        }

        self.persist().await?;
        Ok(None)
    }

    /// Drains any parts whose task has finished, applying the
    /// `part_completed`/`part_canceled` handlers from §4.5. Returns an exit
    /// only for the critical cases (url expired, dest missing).
    async fn reap_finished_parts(&mut self) -> Result<Option<EngineExit>> {
        let mut still_running = Vec::with_capacity(self.parts.len());
        let mut finished = Vec::new();
        for running in std::mem::take(&mut self.parts) {
            if running.task.is_finished() {
                finished.push(running);
            } else {
                still_running.push(running);
            }
        }
        self.parts = still_running;

        for running in finished {
            let index = running.part.index;
            let outcome = running.task.await.context("part worker task panicked")?;
            match outcome {
                PartOutcome::Completed => {
                    self.record.part_downloaded[index] = running.downloaded.load(Ordering::Relaxed);
                }
                PartOutcome::Canceled => {
                    // Cooperative cancellation from our own job_token; the
                    // outer tick loop already observed it and will exit.
                }
                PartOutcome::UrlExpired => {
                    self.record.is_url_expired = true;
                    return Ok(Some(self.cancel_internal("link expired").await?));
                }
                PartOutcome::DestMissing => {
                    self.record.is_dest_missing = true;
                    return Ok(Some(self.cancel_internal("dest_missing").await?));
                }
                PartOutcome::Failed(reason) => {
                    let max_errors = self.record.settings.download_auto_resume_max_errors;
                    let can_retry = self.record.is_running
                        && self.record.total_connection_retries < max_errors
                        && self.net.check(self.record.settings.download_wifi_only).is_none();
                    if can_retry {
                        self.record.total_connection_retries += 1;
                        let writer = if std::path::Path::new(&self.record.destination_path).exists() {
                            StorageWriter::open_existing(std::path::Path::new(&self.record.destination_path))?
                        } else {
                            self.record.is_dest_missing = true;
                            return Ok(Some(self.cancel_internal("dest_missing").await?));
                        };
                        let downloaded = self.record.part_downloaded[index];
                        self.spawn_part(index, &writer, downloaded)?;
                    } else {
                        tracing::warn!(job_id = %self.record.job_id, index, reason, "part exhausted retries");
                    }
                }
            }
        }
        Ok(None)
    }

    async fn finish(&mut self) -> Result<EngineExit> {
        self.record.is_complete = true;
        self.record.is_running = false;
        self.record.status = JobStatus::Complete;
        self.record.user_status_text = "completed".to_string();

        let path = std::path::PathBuf::from(&self.record.destination_path);
        match tokio::task::spawn_blocking(move || checksum::sha256_path(&path)).await {
            Ok(Ok(digest)) => self.record.checksum = Some(digest),
            Ok(Err(e)) => {
                tracing::warn!(job_id = %self.record.job_id, error = %e, "checksum computation failed")
            }
            Err(e) => {
                tracing::warn!(job_id = %self.record.job_id, error = %e, "checksum task panicked")
            }
        }

        self.persist().await?;
        self.observers.on_finish(&self.record);
        Ok(EngineExit::Completed)
    }

    /// `cancel(reason)` (§4.5): stop every part, pause, persist, and delete
    /// the destination if this was a full delete rather than a pause.
    async fn cancel_internal(&mut self, reason: &str) -> Result<EngineExit> {
        for running in &self.parts {
            running.token.store(true, Ordering::Relaxed);
        }
        for running in std::mem::take(&mut self.parts) {
            let _ = running.task.await;
        }

        self.record.is_running = false;
        self.record.status = JobStatus::Paused;
        self.record.user_status_text = reason.to_string();
        self.persist().await?;

        if self.record.is_deleted && !self.record.is_removed {
            let _ = tokio::fs::remove_file(&self.record.destination_path).await;
            return Ok(EngineExit::Deleted);
        }

        Ok(EngineExit::Paused(reason.to_string()))
    }

    /// Public cancellation entry point used by the Scheduler (pause/delete).
    pub async fn cancel(&mut self, reason: &str) -> Result<EngineExit> {
        self.cancel_internal(reason).await
    }

    async fn persist(&mut self) -> Result<()> {
        self.store.save(&mut self.record).await?;
        self.observers.update_active_ui(&self.record);
        Ok(())
    }
}
