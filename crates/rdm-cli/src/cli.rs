use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rdm_core::config;
use rdm_core::net::SystemNetworkMonitor;
use rdm_core::observer::{Observer, ObserverBus};
use rdm_core::record::{generate_job_id, JobRecord, JobStatus, RecordStore};
use rdm_core::scheduler::Scheduler;
use rdm_core::snapshot::SnapshotMerger;
use rdm_core::url_model::derive_filename;

/// Top-level CLI for the RDM download manager.
#[derive(Debug, Parser)]
#[command(name = "rdm")]
#[command(about = "RDM: resumable multi-part download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download job.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,

        /// Destination directory; defaults to the current directory.
        #[arg(long)]
        dir: Option<String>,

        /// Referrer header to send with every request for this job.
        #[arg(long)]
        referrer: Option<String>,

        /// Cookie header value to send with every request for this job.
        #[arg(long)]
        cookie: Option<String>,

        /// Send browser-fidelity headers (Sec-Fetch-*, Accept-Language, ...).
        #[arg(long)]
        browser: bool,
    },

    /// Run the scheduler and snapshot merger until interrupted.
    Run,

    /// Show every active and finished job.
    Status,

    /// Pause a running or queued job by its id.
    Pause { id: String },

    /// Resume a paused job by its id.
    Resume { id: String },

    /// Pause, wait briefly, then resume a job — used to recover from a
    /// connection reset without the user intervening.
    ForceResume { id: String },

    /// Remove a job's record and, if present, its destination file.
    Remove { id: String },

    /// Pause every active job.
    PauseAll,

    /// Resume every paused job.
    ResumeAll,

    /// Remove every job and its destination file.
    DeleteAll,
}

/// A console observer: the minimum "UI" an out-of-process app would layer
/// on top of the Observer Bus, reduced to stdout lines.
struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn update_active_ui(&self, record: &JobRecord) {
        println!(
            "[{}] {:>5.1}%  {:>10.0} B/s  {}",
            &record.job_id[..8.min(record.job_id.len())],
            record.progress_percent,
            record.realtime_speed,
            record.file_name
        );
    }

    fn add_new_active_ui(&self, record: &JobRecord, position: usize) {
        println!("queued #{position}: {} ({})", record.file_name, record.job_id);
    }

    fn on_finish(&self, record: &JobRecord) {
        if record.settings.download_play_notification_sound {
            print!("\x07");
        }
        println!("finished: {} -> {}", record.file_name, record.destination_path);
    }

    fn update_notification(&self, record: &JobRecord) {
        println!("removed: {}", record.file_name);
    }
}

/// Assembles the scheduler's dependencies from the on-disk state directories
/// and loads it from the snapshot/record store. Shared by every subcommand.
async fn build_scheduler() -> Result<(Scheduler, SnapshotMerger, Arc<RecordStore>)> {
    let settings = config::load_or_init()?;
    let state_dir = config::state_dir()?;
    let records_dir = state_dir.join("records");

    let store = Arc::new(RecordStore::with_default_concurrency(&records_dir)?);
    let snapshot = SnapshotMerger::new(SnapshotMerger::default_path_under(&state_dir));

    let observers = ObserverBus::new();
    observers.register(Arc::new(ConsoleObserver));
    let net = Arc::new(SystemNetworkMonitor::default());

    let scheduler = Scheduler::new(Arc::clone(&store), observers, net, settings);
    scheduler.load(&snapshot).await?;
    Ok((scheduler, snapshot, store))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn print_record_line(record: &JobRecord) {
    let status = match record.status {
        JobStatus::Waiting => "waiting",
        JobStatus::Downloading => "downloading",
        JobStatus::Paused => "paused",
        JobStatus::Complete => "complete",
    };
    println!(
        "{}  {:<11}  {:>5.1}%  {}",
        record.job_id, status, record.progress_percent, record.file_name
    );
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            CliCommand::Add {
                url,
                dir,
                referrer,
                cookie,
                browser,
            } => {
                let settings = config::load_or_init()?;
                let file_name = derive_filename(&url, None);
                let file_directory = dir.unwrap_or_else(|| ".".to_string());
                let destination_path = std::path::Path::new(&file_directory)
                    .join(&file_name)
                    .to_string_lossy()
                    .into_owned();

                let now = now_ms();
                let job_id = generate_job_id(&url, now);
                let mut record = JobRecord::new_waiting(
                    job_id.clone(),
                    url,
                    destination_path,
                    file_name,
                    file_directory,
                    settings,
                    now,
                );
                record.referrer = referrer;
                record.cookie_string = cookie;
                record.from_browser = browser;

                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.add(record).await?;
                println!("added job {job_id}");
            }
            CliCommand::Run => {
                let (scheduler, snapshot, store) = build_scheduler().await?;
                let scheduler = Arc::new(scheduler);
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

                let promotion = {
                    let scheduler = Arc::clone(&scheduler);
                    tokio::spawn(async move { scheduler.run_promotion_loop(shutdown_rx).await })
                };

                let merger_loop = {
                    let mut shutdown_rx = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
                        loop {
                            tokio::select! {
                                _ = interval.tick() => {
                                    if let Err(e) = snapshot.tick(&store).await {
                                        tracing::warn!(error = %e, "snapshot tick failed");
                                    }
                                }
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        break;
                                    }
                                }
                            }
                        }
                    })
                };

                tracing::info!("scheduler running, press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                tracing::info!("shutting down");
                let _ = shutdown_tx.send(true);
                let _ = promotion.await;
                let _ = merger_loop.await;
            }
            CliCommand::Status => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                for record in scheduler.active_records().await {
                    print_record_line(&record);
                }
                for record in scheduler.finished_records().await {
                    print_record_line(&record);
                }
            }
            CliCommand::Pause { id } => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.pause(&id).await?;
            }
            CliCommand::Resume { id } => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.resume(&id).await?;
            }
            CliCommand::ForceResume { id } => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.force_resume(&id).await?;
            }
            CliCommand::Remove { id } => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.delete(&id).await?;
            }
            CliCommand::PauseAll => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.pause_all().await?;
            }
            CliCommand::ResumeAll => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.resume_all().await?;
            }
            CliCommand::DeleteAll => {
                let (scheduler, _snapshot, _store) = build_scheduler().await?;
                scheduler.delete_all().await?;
            }
        }

        Ok(())
    }
}
