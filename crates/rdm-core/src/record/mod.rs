//! Model persistence: the durable `JobRecord` and the Record Store that
//! serializes one record per job to a flat directory.

mod store;
mod types;

pub use store::RecordStore;
pub use types::{generate_job_id, JobRecord, JobStatus};
