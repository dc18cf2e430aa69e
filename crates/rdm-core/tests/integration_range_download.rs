//! Integration test: local HTTP server with Range support, multi-segment
//! download and resume, driven through the real Scheduler/Job Engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rdm_core::config::GlobalSettings;
use rdm_core::net::NetworkMonitor;
use rdm_core::observer::ObserverBus;
use rdm_core::record::{generate_job_id, JobRecord, RecordStore};
use rdm_core::scheduler::Scheduler;
use tempfile::tempdir;

struct AlwaysOnline;
impl NetworkMonitor for AlwaysOnline {
    fn is_network_available(&self) -> bool {
        true
    }
    fn is_wifi_enabled(&self) -> bool {
        true
    }
    fn is_internet_reachable(&self) -> bool {
        true
    }
}

async fn run_to_completion(scheduler: &Scheduler, job_id: &str) {
    for _ in 0..200 {
        scheduler.tick().await.unwrap();
        if scheduler.finished_job_ids().await.contains(&job_id.to_string()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached finished within the test timeout");
}

async fn download_and_verify(url: &str, download_dir: &std::path::Path, body: &[u8]) {
    let record_dir = tempdir().unwrap();
    let store = Arc::new(RecordStore::new(record_dir.path(), 8).unwrap());
    let mut settings = GlobalSettings::default();
    settings.download_default_thread_connections = 4;
    let scheduler = Scheduler::new(store, ObserverBus::new(), Arc::new(AlwaysOnline), settings.clone());

    let now = 0;
    let job_id = generate_job_id(url, now);
    let destination_path = download_dir.join("download.bin").to_string_lossy().into_owned();
    let record = JobRecord::new_waiting(
        job_id.clone(),
        url.to_string(),
        destination_path.clone(),
        "download.bin".to_string(),
        download_dir.to_string_lossy().into_owned(),
        settings,
        now,
    );
    scheduler.add(record).await.unwrap();

    run_to_completion(&scheduler, &job_id).await;

    let content = std::fs::read(&destination_path).unwrap();
    assert_eq!(content.len(), body.len(), "file size must match");
    assert_eq!(content, body, "file content must match");
}

#[tokio::test]
async fn multi_segment_download_completes_and_file_matches() {
    let body: Vec<u8> = (0u8..100).cycle().take(64 * 1024).collect();
    let url = common::range_server::start(body.clone());
    let download_dir = tempdir().unwrap();
    download_and_verify(&url, download_dir.path(), &body).await;
}

#[tokio::test]
async fn head_blocked_falls_back_to_range_probe_and_completes() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions {
            head_allowed: false,
            support_ranges: true,
            advertise_ranges: true,
        },
    );
    let download_dir = tempdir().unwrap();
    download_and_verify(&url, download_dir.path(), &body).await;
}

#[tokio::test]
async fn no_range_server_falls_back_to_single_stream_get() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions {
            head_allowed: true,
            support_ranges: false,
            advertise_ranges: false,
        },
    );
    let download_dir = tempdir().unwrap();
    download_and_verify(&url, download_dir.path(), &body).await;
}
