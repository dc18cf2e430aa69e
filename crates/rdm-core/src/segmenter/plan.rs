//! Aligned partition plan.

/// Default alignment for part boundaries, in bytes.
pub const DEFAULT_ALIGNMENT: u64 = 4096;

/// One part of a job's partition plan: an inclusive byte range `[start, end]`
/// and its chunk size (`end - start + 1`). Mirrors the `part_start[i]`,
/// `part_end[i]`, `part_chunk_size[i]` arrays carried on `JobRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub index: usize,
    /// Start offset, inclusive.
    pub start: u64,
    /// End offset, inclusive.
    pub end: u64,
    pub chunk_size: u64,
}

impl Part {
    /// HTTP Range header value for a fresh start: `bytes=start-end`.
    pub fn range_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// HTTP Range header value resuming from `downloaded` bytes already
    /// written into this part.
    pub fn range_header_value_resuming(&self, downloaded: u64) -> String {
        format!("bytes={}-{}", self.start + downloaded, self.end)
    }
}

/// Rounds `v` up to the nearest value congruent to `alignment - 1` modulo
/// `alignment` (i.e. the last byte of an alignment-sized block). Used so
/// part boundaries land on 4 KiB block edges.
pub fn align_up(v: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return v;
    }
    let boundary = (v / alignment + 1) * alignment;
    boundary - 1
}

/// Builds the partition plan for a job.
///
/// - `total_size = None` (size unknown): one unbounded part, `Range:
///   bytes=0-`, `chunk_size = 0`.
/// - `total_size = Some(0)`: one part of length 0; the job completes with
///   no bytes downloaded.
/// - `thread_count <= 1`: one part covering `[0, total_size - 1]`.
/// - Otherwise: `thread_count` parts (clamped so no part is empty) using
///   aligned boundaries: `base = total_size / N`; part `i` starts at `i *
///   base`; ends at `align_up(start + base - 1, alignment)`; the final part
///   always ends at `total_size - 1`.
pub fn plan_parts(total_size: Option<u64>, thread_count: usize, alignment: u64) -> Vec<Part> {
    let total_size = match total_size {
        None => {
            return vec![Part {
                index: 0,
                start: 0,
                end: 0,
                chunk_size: 0,
            }]
        }
        Some(0) => {
            return vec![Part {
                index: 0,
                start: 0,
                end: 0,
                chunk_size: 0,
            }]
        }
        Some(n) => n,
    };

    let n = thread_count.max(1).min(total_size as usize).max(1);
    if n <= 1 {
        return vec![Part {
            index: 0,
            start: 0,
            end: total_size - 1,
            chunk_size: total_size,
        }];
    }

    let n_u64 = n as u64;
    let base = total_size / n_u64;
    let mut parts = Vec::with_capacity(n);
    let mut start = 0u64;

    for i in 0..n {
        let end = if i + 1 == n {
            total_size - 1
        } else {
            align_up(start + base - 1, alignment).min(total_size - 1)
        };
        parts.push(Part {
            index: i,
            start,
            end,
            chunk_size: end - start + 1,
        });
        start = end + 1;
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_block_minus_one() {
        assert_eq!(align_up(3332, 4096), 4095);
        assert_eq!(align_up(7428, 4096), 8191);
        assert_eq!(align_up(4095, 4096), 4095);
    }

    #[test]
    fn plan_parts_matches_spec_example() {
        let parts = plan_parts(Some(10_000), 3, 4096);
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].start, parts[0].end), (0, 4095));
        assert_eq!((parts[1].start, parts[1].end), (4096, 8191));
        assert_eq!((parts[2].start, parts[2].end), (8192, 9999));
        let sum: u64 = parts.iter().map(|p| p.chunk_size).sum();
        assert_eq!(sum, 10_000);
    }

    #[test]
    fn plan_parts_unknown_size_is_single_unbounded_part() {
        let parts = plan_parts(None, 4, 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].chunk_size, 0);
        assert_eq!(parts[0].range_header_value(), "bytes=0-0");
    }

    #[test]
    fn plan_parts_zero_size_is_single_empty_part() {
        let parts = plan_parts(Some(0), 4, 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].chunk_size, 0);
    }

    #[test]
    fn plan_parts_thread_count_one_is_single_full_range_part() {
        let parts = plan_parts(Some(500), 1, 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!((parts[0].start, parts[0].end), (0, 499));
        assert_eq!(parts[0].chunk_size, 500);
    }

    #[test]
    fn plan_parts_disjoint_and_covering() {
        let parts = plan_parts(Some(1_000_003), 5, 4096);
        let mut covered = 0u64;
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                assert_eq!(p.start, parts[i - 1].end + 1);
            }
            covered += p.chunk_size;
        }
        assert_eq!(covered, 1_000_003);
        assert_eq!(parts.last().unwrap().end, 1_000_002);
    }

    #[test]
    fn plan_parts_clamps_thread_count_to_total_size() {
        let parts = plan_parts(Some(3), 8, 4096);
        assert!(parts.len() <= 3);
        let sum: u64 = parts.iter().map(|p| p.chunk_size).sum();
        assert_eq!(sum, 3);
    }

    #[test]
    fn range_header_value_resuming_offsets_by_downloaded() {
        let parts = plan_parts(Some(10_000), 3, 4096);
        assert_eq!(
            parts[1].range_header_value_resuming(100),
            "bytes=4196-8191"
        );
    }
}
