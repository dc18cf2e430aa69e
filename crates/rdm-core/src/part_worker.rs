//! Part Worker: downloads one byte range of a job into the shared
//! destination file, retrying transient failures in place and reporting
//! incremental progress back to the Job Engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::retry::{self, RetryPolicy, SegmentError};
use crate::segmenter::Part;
use crate::storage::StorageWriter;

/// Everything a Part Worker needs to drive one part's transfer, independent
/// of the job's persisted record.
#[derive(Debug, Clone)]
pub struct PartRequest {
    pub url: String,
    pub part: Part,
    /// Bytes already written into this part from a previous attempt or a
    /// resumed job; the Range header is offset by this amount.
    pub downloaded_so_far: u64,
    pub referrer: Option<String>,
    pub cookie_string: Option<String>,
    pub content_disposition: Option<String>,
    /// Present when the job was captured from a browser extension; adds the
    /// extra browser-fidelity headers servers sometimes require.
    pub from_browser: bool,
    /// Per-part throttle, bytes/sec, applied via curl's native cap.
    pub max_recv_speed: Option<u64>,
    /// `download_http_user_agent`, or `browser_http_user_agent` when
    /// `from_browser` is set — chosen by the caller, sent as-is.
    pub user_agent: String,
    /// `download_auto_link_redirection`.
    pub follow_redirects: bool,
    /// `download_max_http_reading_timeout`, applied to both connect and
    /// overall transfer time.
    pub timeout_ms: u64,
    /// `download_buffer_size`.
    pub buffer_size: usize,
}

/// How a part's transfer ended.
#[derive(Debug)]
pub enum PartOutcome {
    /// The full chunk was written.
    Completed,
    /// The abort token was observed; no further attempts are made.
    Canceled,
    /// The destination file vanished out from under the writer.
    DestMissing,
    /// The server returned 404, signaling the URL is no longer valid.
    UrlExpired,
    /// Every retry attempt was exhausted.
    Failed(String),
}

/// Runs one part to completion (or terminal failure), retrying transient
/// errors with `policy` and resuming from wherever the previous attempt
/// left off. Blocking: call from `tokio::task::spawn_blocking`.
///
/// `on_progress` is invoked with the number of bytes newly written for this
/// part (not a running total) as they land on disk.
pub fn run_part(
    request: &PartRequest,
    writer: &StorageWriter,
    token: &Arc<AtomicBool>,
    policy: &RetryPolicy,
    mut on_progress: impl FnMut(u64),
) -> PartOutcome {
    if !writer.path().exists() {
        return PartOutcome::DestMissing;
    }

    let mut downloaded = request.downloaded_so_far;
    let result = retry::run_with_retry(policy, || {
        if token.load(Ordering::Relaxed) {
            return Ok(AttemptOutcome::Canceled);
        }
        try_once(request, writer, token, downloaded, &mut on_progress).map_err(|(err, bytes_this_attempt)| {
            downloaded += bytes_this_attempt;
            err
        })
    });

    match result {
        Ok(AttemptOutcome::Completed) => PartOutcome::Completed,
        Ok(AttemptOutcome::Canceled) => PartOutcome::Canceled,
        Ok(AttemptOutcome::UrlExpired) => PartOutcome::UrlExpired,
        Err(err) => PartOutcome::Failed(err.to_string()),
    }
}

enum AttemptOutcome {
    Completed,
    Canceled,
    UrlExpired,
}

/// Performs a single HTTP request for the remaining bytes of `request.part`,
/// starting at `downloaded` bytes already written. Returns the number of
/// bytes written during *this* attempt on both success and failure so the
/// caller can resume correctly.
fn try_once(
    request: &PartRequest,
    writer: &StorageWriter,
    token: &Arc<AtomicBool>,
    downloaded: u64,
    on_progress: &mut impl FnMut(u64),
) -> Result<AttemptOutcome, (SegmentError, u64)> {
    let part = &request.part;
    let unbounded = part.chunk_size == 0 && part.start == 0 && part.end == 0;
    if !unbounded && downloaded >= part.chunk_size {
        return Ok(AttemptOutcome::Completed);
    }

    let mut easy = curl::easy::Easy::new();
    easy.url(&request.url)
        .map_err(|e| (SegmentError::Curl(e), 0))?;
    easy.follow_location(request.follow_redirects)
        .map_err(|e| (SegmentError::Curl(e), 0))?;
    let timeout = Duration::from_millis(request.timeout_ms);
    easy.connect_timeout(timeout)
        .map_err(|e| (SegmentError::Curl(e), 0))?;
    easy.timeout(timeout).map_err(|e| (SegmentError::Curl(e), 0))?;
    easy.buffer_size(request.buffer_size)
        .map_err(|e| (SegmentError::Curl(e), 0))?;

    let range = if unbounded {
        None
    } else {
        Some(part.range_header_value_resuming(downloaded))
    };
    if let Some(range) = &range {
        easy.range(range).map_err(|e| (SegmentError::Curl(e), 0))?;
    }

    if let Some(bytes_per_sec) = request.max_recv_speed {
        easy.max_recv_speed(bytes_per_sec)
            .map_err(|e| (SegmentError::Curl(e), 0))?;
    }

    let headers = build_headers(request).map_err(|e| (SegmentError::Curl(e), 0))?;
    easy.http_headers(headers)
        .map_err(|e| (SegmentError::Curl(e), 0))?;

    let write_offset = part.start + downloaded;
    let mut written_this_attempt = 0u64;
    let mut canceled = false;
    let mut storage_err: Option<std::io::Error> = None;

    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(|data| {
                if token.load(Ordering::Relaxed) {
                    canceled = true;
                    return Ok(0);
                }
                match writer.write_at(write_offset + written_this_attempt, data) {
                    Ok(()) => {
                        written_this_attempt += data.len() as u64;
                        on_progress(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(e) => {
                        storage_err = Some(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                        Ok(0)
                    }
                }
            })
            .map_err(|e| (SegmentError::Curl(e), 0))?;

        let perform_result = transfer.perform();
        drop(transfer);

        if let Some(io_err) = storage_err {
            return Err((SegmentError::Storage(io_err), written_this_attempt));
        }
        if canceled {
            return Ok(AttemptOutcome::Canceled);
        }
        if let Err(e) = perform_result {
            return Err((SegmentError::Curl(e), written_this_attempt));
        }
    }

    let code = easy
        .response_code()
        .map_err(|e| (SegmentError::Curl(e), written_this_attempt))?;
    if code == 404 {
        return Ok(AttemptOutcome::UrlExpired);
    }
    if !(200..300).contains(&code) {
        return Err((SegmentError::Http(code), written_this_attempt));
    }

    if !unbounded {
        let total = downloaded + written_this_attempt;
        if total < part.chunk_size {
            return Err((
                SegmentError::PartialTransfer {
                    expected: part.chunk_size,
                    received: total,
                },
                written_this_attempt,
            ));
        }
    }

    Ok(AttemptOutcome::Completed)
}

fn build_headers(request: &PartRequest) -> Result<curl::easy::List, curl::Error> {
    let mut list = curl::easy::List::new();
    list.append("Accept: */*")?;

    list.append(&format!("User-Agent: {}", request.user_agent))?;

    if request.from_browser {
        if let Ok(parsed) = Url::parse(&request.url) {
            if let Some(host) = parsed.host_str() {
                list.append(&format!("Host: {host}"))?;
            }
        }
        if let Some(referrer) = &request.referrer {
            if let Ok(parsed) = Url::parse(referrer) {
                if let Some(host) = parsed.host_str() {
                    let scheme = parsed.scheme();
                    list.append(&format!("Referer: {scheme}://{host}/"))?;
                }
            }
        }
        if let Some(cd) = &request.content_disposition {
            list.append(&format!("Content-Disposition: {cd}"))?;
        }
        if let Some(cookie) = &request.cookie_string {
            list.append(&format!("Cookie: {cookie}"))?;
        }
        list.append("Accept-Language: en-US,en;q=0.9")?;
        list.append("Sec-Fetch-Mode: no-cors")?;
        list.append("Sec-Fetch-Site: same-origin")?;
        list.append("Sec-Fetch-Dest: empty")?;
    }

    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::plan_parts;

    fn request_for(part: Part) -> PartRequest {
        PartRequest {
            url: "https://example.com/missing.bin".to_string(),
            part,
            downloaded_so_far: 0,
            referrer: None,
            cookie_string: None,
            content_disposition: None,
            from_browser: false,
            max_recv_speed: None,
            user_agent: "rdm-test/0.0".to_string(),
            follow_redirects: true,
            timeout_ms: 15_000,
            buffer_size: 64 * 1024,
        }
    }

    #[test]
    fn dest_missing_short_circuits_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone.bin");
        let mut builder = crate::storage::StorageWriterBuilder::create(&dest).unwrap();
        builder.preallocate(10).unwrap();
        let writer = builder.build();
        std::fs::remove_file(&dest).unwrap();

        let parts = plan_parts(Some(10), 1, 4096);
        let token = Arc::new(AtomicBool::new(false));
        let policy = RetryPolicy::default();
        let outcome = run_part(&request_for(parts[0]), &writer, &token, &policy, |_| {});
        assert!(matches!(outcome, PartOutcome::DestMissing));
    }

    #[test]
    fn canceled_token_short_circuits_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("present.bin");
        let mut builder = crate::storage::StorageWriterBuilder::create(&dest).unwrap();
        builder.preallocate(10).unwrap();
        let writer = builder.build();

        let parts = plan_parts(Some(10), 1, 4096);
        let token = Arc::new(AtomicBool::new(true));
        let policy = RetryPolicy::default();
        let outcome = run_part(&request_for(parts[0]), &writer, &token, &policy, |_| {});
        assert!(matches!(outcome, PartOutcome::Canceled));
    }

    #[test]
    fn build_headers_includes_browser_fidelity_only_when_requested() {
        let mut request = request_for(plan_parts(Some(10), 1, 4096)[0]);
        let plain = build_headers(&request).unwrap();
        let plain_joined: Vec<String> = plain.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert!(!plain_joined.iter().any(|h| h.starts_with("Sec-Fetch")));

        request.from_browser = true;
        request.cookie_string = Some("a=b".to_string());
        let browser = build_headers(&request).unwrap();
        let browser_joined: Vec<String> = browser.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert!(browser_joined.iter().any(|h| h.starts_with("Sec-Fetch")));
        assert!(browser_joined.iter().any(|h| h.starts_with("Cookie: a=b")));
    }

    #[test]
    fn build_headers_uses_request_user_agent() {
        let mut request = request_for(plan_parts(Some(10), 1, 4096)[0]);
        request.user_agent = "custom-agent/9".to_string();
        let headers = build_headers(&request).unwrap();
        let joined: Vec<String> = headers.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert!(joined.iter().any(|h| h == "User-Agent: custom-agent/9"));
    }
}
