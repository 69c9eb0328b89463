//! Conditional requests, cache headers, byte ranges, and content disposition.

use std::time::SystemTime;

use cidgate_core::{ByteRange, Cid, ContentPath, GatewayError};
use http::HeaderMap;
use http::header::{CACHE_CONTROL, ETAG, HeaderValue, IF_NONE_MATCH, LAST_MODIFIED};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// `Cache-Control` for content under an immutable root.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=29030400, immutable";

/// Version folded into generated-page ETags, so a new listing layout
/// invalidates cached pages.
const PAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Characters left alone in Content-Disposition file names.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// ---------------------------------------------------------------------------
// ETags
// ---------------------------------------------------------------------------

/// Strong ETag for a CID, with an optional representation suffix.
///
/// # Examples
///
/// ```
/// use cidgate_core::cids::{RAW, sha256_cid};
/// use cidgate_http::caching::etag;
///
/// let cid = sha256_cid(RAW, b"hello");
/// assert_eq!(etag(&cid, None), format!("\"{cid}\""));
/// assert_eq!(etag(&cid, Some("raw")), format!("\"{cid}.raw\""));
/// ```
#[must_use]
pub fn etag(cid: &Cid, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("\"{cid}.{suffix}\""),
        None => format!("\"{cid}\""),
    }
}

/// Mark an ETag as weak.
#[must_use]
pub fn weak(etag: &str) -> String {
    format!("W/{etag}")
}

/// ETag of a generated directory listing.
#[must_use]
pub fn dir_index_etag(cid: &Cid) -> String {
    format!("W/\"DirIndex-{PAGE_VERSION}_CID-{cid}\"")
}

/// ETag of a generated structured-data summary page.
#[must_use]
pub fn dag_index_etag(cid: &Cid) -> String {
    format!("W/\"DagIndex-{PAGE_VERSION}_CID-{cid}\"")
}

/// Whether an `If-None-Match` value matches `etag`.
///
/// Supports `*`, comma-separated lists, and weak comparison.
///
/// # Examples
///
/// ```
/// use cidgate_http::caching::if_none_match_matches;
///
/// assert!(if_none_match_matches("*", "\"abc\""));
/// assert!(if_none_match_matches("\"xyz\", W/\"abc\"", "\"abc\""));
/// assert!(!if_none_match_matches("\"xyz\"", "\"abc\""));
/// ```
#[must_use]
pub fn if_none_match_matches(if_none_match: &str, etag: &str) -> bool {
    let if_none_match = if_none_match.trim();
    if if_none_match == "*" {
        return true;
    }
    let wanted = normalize_etag(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| candidate == "*" || normalize_etag(candidate) == wanted)
}

/// The request's `If-None-Match` value, if present and readable.
#[must_use]
pub fn if_none_match(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

/// Strip the weak prefix and surrounding quotes.
fn normalize_etag(etag: &str) -> &str {
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(etag)
}

// ---------------------------------------------------------------------------
// Cache headers
// ---------------------------------------------------------------------------

/// Set `Etag` plus the cache policy for `path`.
///
/// Immutable paths get a long-lived `Cache-Control`; mutable ones get the
/// current time as `Last-Modified`.
pub fn set_cache_headers(headers: &mut HeaderMap, path: &ContentPath, etag: &str) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, value);
    }
    if path.is_mutable() {
        set_last_modified_now(headers);
    } else {
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static(IMMUTABLE_CACHE_CONTROL),
        );
    }
}

/// Set `Last-Modified` to the current time.
pub fn set_last_modified_now(headers: &mut HeaderMap) {
    let now = httpdate::fmt_http_date(SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&now) {
        headers.insert(LAST_MODIFIED, value);
    }
}

// ---------------------------------------------------------------------------
// Range header parsing
// ---------------------------------------------------------------------------

/// Parse a `Range` header into byte ranges, without knowing the content size.
///
/// Supported forms, possibly comma separated:
/// - `bytes=0-499` -- first 500 bytes
/// - `bytes=500-` -- from byte 500 to the end
/// - `bytes=-500` -- last 500 bytes
///
/// # Errors
///
/// Returns [`GatewayError::BadRequest`] for a missing `bytes=` unit, a
/// non-numeric bound, or an end before its start.
///
/// # Examples
///
/// ```
/// use cidgate_core::ByteRange;
/// use cidgate_http::caching::parse_ranges;
///
/// let ranges = parse_ranges("bytes=0-4, -3").unwrap();
/// assert_eq!(ranges[0], ByteRange { from: 0, to: Some(4) });
/// assert_eq!(ranges[1], ByteRange { from: 0, to: Some(-3) });
/// ```
pub fn parse_ranges(header: &str) -> Result<Vec<ByteRange>, GatewayError> {
    let invalid = || GatewayError::BadRequest(format!("invalid range: {header}"));

    let spec = header.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    let mut ranges = Vec::new();
    for part in spec.split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }
        let (start, end) = part.split_once('-').ok_or_else(invalid)?;
        let (start, end) = (start.trim(), end.trim());

        let range = if start.is_empty() {
            if end.is_empty() || end.starts_with('-') {
                return Err(invalid());
            }
            let suffix: u64 = end.parse().map_err(|_| invalid())?;
            ByteRange::suffix(suffix)
        } else {
            let from: u64 = start.parse().map_err(|_| invalid())?;
            let to = if end.is_empty() {
                None
            } else {
                let to: i64 = end.parse().map_err(|_| invalid())?;
                if to < 0 || u64::try_from(to).map_or(true, |to| to < from) {
                    return Err(invalid());
                }
                Some(to)
            };
            ByteRange { from, to }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

/// The request's byte ranges; empty when no `Range` header was sent.
pub fn request_ranges(headers: &HeaderMap) -> Result<Vec<ByteRange>, GatewayError> {
    match headers.get(http::header::RANGE) {
        None => Ok(Vec::new()),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| GatewayError::BadRequest("invalid range header".to_owned()))?;
            parse_ranges(value)
        }
    }
}

// ---------------------------------------------------------------------------
// Content-Disposition
// ---------------------------------------------------------------------------

/// Build a `Content-Disposition` value carrying an ASCII fallback name and
/// the UTF-8 name.
///
/// # Examples
///
/// ```
/// use cidgate_http::caching::content_disposition;
///
/// assert_eq!(
///     content_disposition("attachment", "résumé.txt"),
///     "attachment; filename=\"r_sum_.txt\"; filename*=UTF-8''r%C3%A9sum%C3%A9.txt",
/// );
/// ```
#[must_use]
pub fn content_disposition(disposition: &str, filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let ascii = utf8_percent_encode(&ascii, FILENAME_ESCAPE);
    let utf8 = utf8_percent_encode(filename, FILENAME_ESCAPE);
    format!("{disposition}; filename=\"{ascii}\"; filename*=UTF-8''{utf8}")
}
