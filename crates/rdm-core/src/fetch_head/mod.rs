//! URL Probe: HTTP HEAD (GET fallback) to determine size, range support,
//! and a filename hint before a job's parts are planned.

mod parse;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str;
use std::time::Duration;

use crate::config::GlobalSettings;
use crate::url_model;

/// Result of probing a URL: everything the Job Engine needs to plan parts.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total size in bytes, or `-1` when unknown.
    pub size: i64,
    /// `Accept-Ranges: bytes` was present.
    pub multipart_supported: bool,
    /// `multipart_supported` or an ETag/Last-Modified was present.
    pub resume_supported: bool,
    /// Derived filename (Content-Disposition, else URL path, else "unknown").
    pub filename: String,
    /// Non-2xx response or transport failure.
    pub forbidden: bool,
    /// Human-readable error when `forbidden` is set.
    pub error_message: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
}

/// Raw header fields collected off the wire, before deriving the probe shape.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeadFields {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
}

/// Probes `url` with HEAD, falling back to a zero-length ranged GET when the
/// server rejects HEAD, following redirects and preserving custom headers
/// (cookies, referrer) across them.
pub fn probe(
    url: &str,
    custom_headers: &HashMap<String, String>,
    settings: &GlobalSettings,
) -> ProbeResult {
    match probe_inner(url, custom_headers, settings, false) {
        Ok(fields) => finish(url, fields),
        Err(_) => match probe_inner(url, custom_headers, settings, true) {
            Ok(fields) => finish(url, fields),
            Err(e) => ProbeResult {
                size: -1,
                multipart_supported: false,
                resume_supported: false,
                filename: "unknown".to_string(),
                forbidden: true,
                error_message: Some(e.to_string()),
                etag: None,
                last_modified: None,
                content_disposition: None,
            },
        },
    }
}

fn finish(url: &str, fields: HeadFields) -> ProbeResult {
    let multipart_supported = fields.accept_ranges;
    let resume_supported =
        multipart_supported || fields.etag.is_some() || fields.last_modified.is_some();
    let filename = url_model::derive_filename(url, fields.content_disposition.as_deref());
    ProbeResult {
        size: fields.content_length.map(|n| n as i64).unwrap_or(-1),
        multipart_supported,
        resume_supported,
        filename,
        forbidden: false,
        error_message: None,
        etag: fields.etag,
        last_modified: fields.last_modified,
        content_disposition: fields.content_disposition,
    }
}

fn probe_inner(
    url: &str,
    custom_headers: &HashMap<String, String>,
    settings: &GlobalSettings,
    use_get: bool,
) -> Result<HeadFields> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    if use_get {
        easy.get(true)?;
        easy.range("0-0")?;
    } else {
        easy.nobody(true)?;
    }
    easy.follow_location(settings.download_auto_link_redirection)?;
    let timeout = Duration::from_millis(settings.download_max_http_reading_timeout);
    easy.connect_timeout(timeout)?;
    easy.timeout(timeout)?;
    easy.buffer_size(settings.download_buffer_size)?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        if use_get {
            transfer.write_function(|data| Ok(data.len()))?;
        }
        transfer.perform().context("probe request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if code < 200 || code >= 300 {
        anyhow::bail!("probe {} returned HTTP {}", url, code);
    }

    parse::parse_headers(&headers)
}
