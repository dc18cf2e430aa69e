//! Concurrency cap on simultaneously running jobs.

/// Bound on `|running_tasks|` (§4.6, §8: "at no point does running_tasks
/// exceed max_parallel_downloads"). A thin wrapper rather than a bare
/// integer so the cap's source and its "is there room" question read the
/// same way at every call site.
pub struct ConcurrencySlots {
    max_parallel: usize,
}

impl ConcurrencySlots {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn available(&self, currently_running: usize) -> bool {
        currently_running < self.max_parallel
    }
}
