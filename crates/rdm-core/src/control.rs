//! Job control for pause/cancel: shared abort tokens.
//!
//! Each running job's engine registers an abort token with the `JobControl`
//! held by the scheduler. Pause/delete/force-resume request abort through
//! this registry; the part workers check the token on every read and stop
//! at most one buffer later, per the cooperative cancellation contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Error returned when a download is stopped by user (pause/cancel/delete).
#[derive(Debug)]
pub struct JobAborted;

impl std::fmt::Display for JobAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job aborted by user")
    }
}

impl std::error::Error for JobAborted {}

/// Shared registry of job id -> abort token. The scheduler passes one token
/// per running job into its Job Engine; the engine clones it into a token
/// tree, one child per Part Worker.
#[derive(Default)]
pub struct JobControl {
    jobs: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running job; returns the abort token to pass to the engine.
    pub fn register(&self, job_id: &str) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.jobs
            .write()
            .unwrap()
            .insert(job_id.to_string(), Arc::clone(&token));
        token
    }

    /// Unregister a job (call when the job stops running, any reason).
    pub fn unregister(&self, job_id: &str) {
        self.jobs.write().unwrap().remove(job_id);
    }

    /// Request abort for a job. The engine's next tick observes the token
    /// set and stops every part.
    pub fn request_abort(&self, job_id: &str) {
        if let Some(token) = self.jobs.read().unwrap().get(job_id) {
            token.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a job is currently registered (i.e. actively running).
    pub fn is_registered(&self, job_id: &str) -> bool {
        self.jobs.read().unwrap().contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_abort_sets_token() {
        let control = JobControl::new();
        let token = control.register("job-1");
        assert!(!token.load(Ordering::Relaxed));
        control.request_abort("job-1");
        assert!(token.load(Ordering::Relaxed));
    }

    #[test]
    fn abort_unknown_job_is_noop() {
        let control = JobControl::new();
        control.request_abort("nope");
    }

    #[test]
    fn unregister_removes_entry() {
        let control = JobControl::new();
        control.register("job-1");
        assert!(control.is_registered("job-1"));
        control.unregister("job-1");
        assert!(!control.is_registered("job-1"));
    }
}
