//! Scheduler (§4.6): global queue of jobs; admits, pauses, resumes, and
//! deletes them; enforces the max-concurrent-jobs cap; promotes waiting
//! jobs to running on a fixed tick.

mod slots;

use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::GlobalSettings;
use crate::control::JobControl;
use crate::engine::{EngineExit, JobEngine};
use crate::net::NetworkMonitor;
use crate::observer::ObserverBus;
use crate::record::{JobRecord, JobStatus, RecordStore};
use crate::snapshot::SnapshotMerger;
use slots::ConcurrencySlots;

const PROMOTION_TICK: Duration = Duration::from_millis(500);
const FORCE_RESUME_DELAY: Duration = Duration::from_millis(1_200);

struct RunningJob {
    handle: JoinHandle<Result<EngineExit>>,
}

struct SchedulerState {
    active: HashMap<String, JobRecord>,
    finished: HashMap<String, JobRecord>,
    waiting_tasks: VecDeque<String>,
    running_tasks: HashMap<String, RunningJob>,
    tick_count: u64,
}

/// Owns the global job population. A coarse lock on `SchedulerState` backs
/// every operation, matching the "ticks do not overlap" guarantee in §5 —
/// this is a queue of jobs, not a hot data-plane, so one mutex is enough.
pub struct Scheduler {
    store: Arc<RecordStore>,
    observers: ObserverBus,
    net: Arc<dyn NetworkMonitor>,
    control: Arc<JobControl>,
    settings: GlobalSettings,
    slots: ConcurrencySlots,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<RecordStore>,
        observers: ObserverBus,
        net: Arc<dyn NetworkMonitor>,
        settings: GlobalSettings,
    ) -> Self {
        Self {
            store,
            observers,
            net,
            control: Arc::new(JobControl::new()),
            slots: ConcurrencySlots::new(settings.download_default_parallel_connections),
            settings,
            state: Mutex::new(SchedulerState {
                active: HashMap::new(),
                finished: HashMap::new(),
                waiting_tasks: VecDeque::new(),
                running_tasks: HashMap::new(),
                tick_count: 0,
            }),
        }
    }

    /// Cold start (§4.6): prefer the snapshot, fall back to the Record
    /// Store; partition by status, purge retention-expired finished jobs
    /// and completed jobs with a missing destination file, and sort both
    /// collections by `start_time_ms` descending.
    pub async fn load(&self, snapshot: &SnapshotMerger) -> Result<()> {
        let records = match snapshot.load_snapshot(&self.store).await {
            Some(records) => records,
            None => self.store.list_records().await?,
        };

        let mut active = Vec::new();
        let mut finished = Vec::new();
        let now_ms = now_millis();

        for mut record in records {
            match record.status {
                JobStatus::Complete => {
                    let dest_exists = std::path::Path::new(&record.destination_path).exists();
                    if !dest_exists {
                        let _ = self.store.delete(&record.job_id).await;
                        continue;
                    }
                    if self.settings.download_auto_remove_tasks
                        && self.settings.download_auto_remove_task_after_n_days > 0
                    {
                        let age_days = (now_ms - record.last_modified_ms).max(0) / 1000 / 60 / 60 / 24;
                        if age_days >= self.settings.download_auto_remove_task_after_n_days as i64 {
                            let _ = self.store.delete(&record.job_id).await;
                            continue;
                        }
                    }
                    finished.push(record);
                }
                _ => {
                    record.status = JobStatus::Paused;
                    record.is_running = false;
                    active.push(record);
                }
            }
        }

        active.sort_by_key(|r| std::cmp::Reverse(r.start_time_ms));
        finished.sort_by_key(|r| std::cmp::Reverse(r.start_time_ms));

        let mut state = self.state.lock().await;
        for record in active {
            state.waiting_tasks.push_back(record.job_id.clone());
            state.active.insert(record.job_id.clone(), record);
        }
        for record in finished {
            state.finished.insert(record.job_id.clone(), record);
        }
        Ok(())
    }

    /// `add(record)` (§4.6): route to `resume` if already active, otherwise
    /// admit fresh into the waiting queue.
    pub async fn add(&self, mut record: JobRecord) -> Result<()> {
        let job_id = record.job_id.clone();
        {
            let state = self.state.lock().await;
            if state.active.contains_key(&job_id) {
                drop(state);
                return self.resume(&job_id).await;
            }
        }

        self.store.save(&mut record).await?;
        let mut state = self.state.lock().await;
        let position = state.waiting_tasks.len();
        state.waiting_tasks.push_back(job_id.clone());
        state.active.insert(job_id, record.clone());
        drop(state);
        self.observers.add_new_active_ui(&record, position);
        Ok(())
    }

    /// `pause(job)`: only acts if the job is currently running or waiting.
    pub async fn pause(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let was_waiting = if let Some(pos) = state.waiting_tasks.iter().position(|id| id == job_id) {
            state.waiting_tasks.remove(pos);
            true
        } else {
            false
        };
        let running = state.running_tasks.remove(job_id);
        if running.is_none() && !was_waiting {
            return Ok(());
        }
        let record = state.active.get(job_id).cloned();
        drop(state);

        if let Some(running) = running {
            self.control.request_abort(job_id);
            let exit = running.handle.await.context("engine task panicked")??;
            self.record_exit(job_id, exit).await?;
        } else if let Some(mut record) = record {
            record.status = JobStatus::Paused;
            record.is_running = false;
            record.user_status_text = "paused".to_string();
            self.store.save(&mut record).await?;
            let mut state = self.state.lock().await;
            state.active.insert(job_id.to_string(), record);
        }
        Ok(())
    }

    /// `force_resume(job)`: pause (if running), wait, then resume. Skips
    /// the resume when the last recorded error looks like an auth failure,
    /// to avoid a login-retry loop.
    pub async fn force_resume(&self, job_id: &str) -> Result<()> {
        let looks_like_login_error = {
            let state = self.state.lock().await;
            state
                .active
                .get(job_id)
                .map(|r| r.user_status_text.to_lowercase().contains("login"))
                .unwrap_or(false)
        };
        if looks_like_login_error {
            return Ok(());
        }

        self.pause(job_id).await?;
        tokio::time::sleep(FORCE_RESUME_DELAY).await;
        self.resume(job_id).await
    }

    /// `resume(job)`: move a paused/waiting job back onto the waiting queue.
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.active.contains_key(job_id) {
            return Ok(());
        }
        if state.running_tasks.contains_key(job_id) || state.waiting_tasks.iter().any(|id| id == job_id) {
            return Ok(());
        }
        state.waiting_tasks.push_back(job_id.to_string());
        Ok(())
    }

    /// `clear(job)`: pause, mark removed, delete the record file only.
    pub async fn clear(&self, job_id: &str) -> Result<()> {
        self.pause(job_id).await?;
        let mut state = self.state.lock().await;
        if let Some(mut record) = state.active.remove(job_id).or_else(|| state.finished.remove(job_id)) {
            record.is_removed = true;
            drop(state);
            let _ = self.store.delete(job_id).await;
            self.observers.update_notification(&record);
        }
        Ok(())
    }

    /// `delete(job)`: clear, then also remove the destination file.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let destination = {
            let state = self.state.lock().await;
            state
                .active
                .get(job_id)
                .or_else(|| state.finished.get(job_id))
                .map(|r| r.destination_path.clone())
        };
        self.clear(job_id).await?;
        if let Some(path) = destination {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }

    pub async fn pause_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .running_tasks
                .keys()
                .chain(state.waiting_tasks.iter())
                .cloned()
                .collect()
        };
        for id in ids {
            self.pause(&id).await?;
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.active.keys().cloned().collect()
        };
        for id in ids {
            self.resume(&id).await?;
        }
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.active.keys().chain(state.finished.keys()).cloned().collect()
        };
        for id in ids {
            self.delete(&id).await?;
        }
        Ok(())
    }

    /// Promotion tick (§4.6), driven by a global 500 ms timer: reap engines
    /// whose tasks finished, then promote from the waiting queue while
    /// under the concurrency cap.
    pub async fn tick(&self) -> Result<()> {
        let finished_ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .running_tasks
                .iter()
                .filter(|(_, j)| j.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in finished_ids {
            let handle = {
                let mut state = self.state.lock().await;
                state.running_tasks.remove(&id)
            };
            if let Some(running) = handle {
                let exit = running.handle.await.context("engine task panicked")??;
                self.record_exit(&id, exit).await?;
            }
        }

        loop {
            let next = {
                let mut state = self.state.lock().await;
                if self.slots.available(state.running_tasks.len()) && !state.waiting_tasks.is_empty() {
                    state.waiting_tasks.pop_front()
                } else {
                    None
                }
            };
            match next {
                Some(job_id) => self.start_engine(job_id).await?,
                None => break,
            }
        }

        let mut state = self.state.lock().await;
        state.tick_count += 1;
        if state.tick_count % 5 == 0 {
            tracing::debug!("refreshing foreground service heartbeat");
        }
        Ok(())
    }

    /// Runs `tick()` on `PROMOTION_TICK` cadence until `shutdown` resolves.
    pub async fn run_promotion_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(PROMOTION_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn start_engine(&self, job_id: String) -> Result<()> {
        let record = {
            let state = self.state.lock().await;
            state.active.get(&job_id).cloned()
        };
        let Some(record) = record else { return Ok(()) };

        let mut engine = JobEngine::new(
            record,
            Arc::clone(&self.store),
            self.observers.clone(),
            Arc::clone(&self.net),
            Arc::clone(&self.control),
        );
        let handle = tokio::spawn(async move { engine.run().await });

        let mut state = self.state.lock().await;
        state.running_tasks.insert(job_id, RunningJob { handle });
        Ok(())
    }

    async fn record_exit(&self, job_id: &str, exit: EngineExit) -> Result<()> {
        let mut state = self.state.lock().await;
        match exit {
            EngineExit::Completed => {
                if let Some(record) = state.active.remove(job_id) {
                    state.finished.insert(job_id.to_string(), record);
                }
            }
            EngineExit::Paused(_) => {
                // Stays in `active`; the record on disk already reflects
                // PAUSED, reloaded lazily by callers that need fresh state.
            }
            EngineExit::Deleted => {
                state.active.remove(job_id);
                state.finished.remove(job_id);
            }
        }
        Ok(())
    }

    pub async fn active_job_ids(&self) -> Vec<String> {
        self.state.lock().await.active.keys().cloned().collect()
    }

    pub async fn finished_job_ids(&self) -> Vec<String> {
        self.state.lock().await.finished.keys().cloned().collect()
    }

    /// Snapshot of every active record, sorted the same way `load()` leaves
    /// them (most recently started first). For status displays that need
    /// more than an id.
    pub async fn active_records(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<JobRecord> = state.active.values().cloned().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.start_time_ms));
        records
    }

    pub async fn finished_records(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<JobRecord> = state.finished.values().cloned().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.start_time_ms));
        records
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running_tasks.len()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
