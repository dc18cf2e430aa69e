//! Partition planning: splits a job into aligned byte-range parts.
//!
//! Replaces an even-split scheme with the aligned-boundary algorithm: part
//! boundaries are rounded up to a multiple of the alignment (default 4 KiB)
//! to encourage aligned disk writes, with the final part absorbing whatever
//! remains up to `total_size - 1`.

mod plan;

pub use plan::{align_up, plan_parts, Part, DEFAULT_ALIGNMENT};
