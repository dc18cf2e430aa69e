//! Retry loop: run a closure until success or policy says stop.

use super::classify;
use super::error::SegmentError;
use super::policy::{RetryDecision, RetryPolicy};

/// Runs a closure until it succeeds or the retry policy says to stop.
/// On retryable failure, sleeps for the backoff duration then tries again.
/// Generic over the closure's success type so callers that need to carry
/// state out of a successful attempt (not just `()`) can still share this
/// loop instead of reimplementing it.
pub fn run_with_retry<T>(
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, SegmentError>,
) -> Result<T, SegmentError> {
    let mut attempt = 1u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let kind = classify::classify(&e);
                match policy.decide(attempt, kind) {
                    RetryDecision::NoRetry => return Err(e),
                    RetryDecision::RetryAfter(d) => {
                        std::thread::sleep(d);
                        attempt += 1;
                    }
                }
            }
        }
    }
}
