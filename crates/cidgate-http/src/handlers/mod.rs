//! Response renderers.
//!
//! [`serve`] takes a parsed content path and a negotiated format and hands
//! the request to exactly one renderer. Every renderer sets `X-Roots` before
//! attaching a body.

mod car;
mod codec;
mod naming;
mod raw;
mod tar;
mod unixfs;

use std::collections::HashMap;

use bytes::Bytes;
use cidgate_core::cids::{DAG_CBOR, DAG_JSON, DAG_PB};
use cidgate_core::{
    Cid, ContentPath, ExportStream, FileContent, GatewayBackend, GatewayError, ImmutablePath,
    PathMetadata,
};
use http::header::{ACCEPT, HeaderValue, TRAILER};
use http::{HeaderMap, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::body::GatewayBody;
use crate::caching::{
    self, content_disposition, dag_index_etag, dir_index_etag, if_none_match, set_cache_headers,
};
use crate::config::GatewayConfig;
use crate::metrics::STREAM_FAILURES;
use crate::negotiate::ResponseFormat;
use crate::response::error_to_response;

/// Header listing the CIDs of every resolved path segment.
pub const ROOTS_HEADER: &str = "x-roots";

/// Decoded query parameters in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Parse a raw query string.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        Self(
            raw.map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
                .unwrap_or_default(),
        )
    }

    /// First value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is set to `true`.
    #[must_use]
    pub fn is_true(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    /// First value of `name`, unless it is empty.
    #[must_use]
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }
}

/// Everything a renderer needs about the current request.
pub(crate) struct RequestContext<'a> {
    pub backend: &'a dyn GatewayBackend,
    pub config: &'a GatewayConfig,
    pub headers: &'a HeaderMap,
    pub is_head: bool,
    pub query: &'a QueryParams,
    pub raw_query: Option<&'a str>,
    /// URL path as the client sent it, before any hostname rewrite.
    pub original_path: &'a str,
    pub origin_isolated: bool,
    pub content_path: ContentPath,
    pub format: ResponseFormat,
    pub format_params: HashMap<String, String>,
}

impl RequestContext<'_> {
    pub fn accept(&self) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }
}

/// Produce the response for a content request.
pub(crate) async fn serve(ctx: &RequestContext<'_>) -> Response<GatewayBody> {
    match serve_format(ctx).await {
        Ok(response) => response,
        Err(err) => {
            let err = err.with_path(&ctx.content_path);
            debug!(path = %ctx.content_path, format = %ctx.format, error = %err, "content request failed");
            error_to_response(&err)
        }
    }
}

async fn serve_format(ctx: &RequestContext<'_>) -> Result<Response<GatewayBody>, GatewayError> {
    match ctx.format {
        ResponseFormat::NamingRecord => naming::serve_naming_record(ctx).await,
        format => {
            let path = ctx.backend.resolve_mutable(&ctx.content_path).await?;
            if let Some(not_modified) = not_modified(ctx, &path).await {
                return Ok(not_modified);
            }
            match format {
                ResponseFormat::Raw => raw::serve_raw_block(ctx, &path).await,
                ResponseFormat::Car => car::serve_car(ctx, &path).await,
                ResponseFormat::Tar => tar::serve_tar(ctx, &path).await,
                ResponseFormat::Json
                | ResponseFormat::Cbor
                | ResponseFormat::DagJson
                | ResponseFormat::DagCbor => codec::serve_codec(ctx, &path).await,
                ResponseFormat::Default | ResponseFormat::NamingRecord => {
                    unixfs::serve_defaults(ctx, &path).await
                }
            }
        }
    }
}

/// Answer `304` when `If-None-Match` matches an ETag the negotiated
/// renderer could have sent. Resolution failures fall through to the renderer.
async fn not_modified(ctx: &RequestContext<'_>, path: &ImmutablePath) -> Option<Response<GatewayBody>> {
    let wanted = if_none_match(ctx.headers)?;
    let md = ctx.backend.resolve_path(path).await.ok()?;
    let cid = md.last_segment.cid;
    let etag = candidate_etags(&cid, ctx.format)
        .into_iter()
        .find(|etag| caching::if_none_match_matches(wanted, etag))?;

    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, &md);
    set_cache_headers(&mut headers, &ctx.content_path, &etag);
    Some(respond(StatusCode::NOT_MODIFIED, headers, GatewayBody::empty()))
}

/// ETags a response in `format` may carry for `cid`.
///
/// Generated pages only exist for the default format: directory listings
/// for dag-pb and summaries for the DAG codecs.
fn candidate_etags(cid: &Cid, format: ResponseFormat) -> Vec<String> {
    let mut etags = vec![etag_for(cid, format)];
    if format == ResponseFormat::Default {
        match cid.codec() {
            DAG_PB => etags.push(dir_index_etag(cid)),
            DAG_JSON | DAG_CBOR => etags.push(dag_index_etag(cid)),
            _ => {}
        }
    }
    etags
}

/// The ETag a response in `format` carries for `cid`.
///
/// The default format takes its suffix from a structured codec, so the same
/// document served by codec and by explicit format shares an ETag.
pub(crate) fn etag_for(cid: &Cid, format: ResponseFormat) -> String {
    let format = match format {
        ResponseFormat::Default => ResponseFormat::for_codec(cid.codec()).unwrap_or(format),
        other => other,
    };
    let etag = caching::etag(cid, format.etag_suffix());
    if format.is_weak() {
        caching::weak(&etag)
    } else {
        etag
    }
}

/// Set `X-Roots` from the resolved path metadata.
pub(crate) fn set_roots_header(headers: &mut HeaderMap, md: &PathMetadata) {
    let roots: Vec<String> = md
        .path_segment_roots
        .iter()
        .chain(std::iter::once(&md.last_segment.cid))
        .map(ToString::to_string)
        .collect();
    if let Ok(value) = HeaderValue::from_str(&roots.join(",")) {
        headers.insert(ROOTS_HEADER, value);
    }
}

/// Assemble a response from parts built up by a renderer.
pub(crate) fn respond(status: StatusCode, headers: HeaderMap, body: GatewayBody) -> Response<GatewayBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Set `Content-Disposition`, ignoring names that cannot be encoded.
pub(crate) fn set_disposition(headers: &mut HeaderMap, disposition: &str, filename: &str) {
    if let Ok(value) = HeaderValue::from_str(&content_disposition(disposition, filename)) {
        headers.insert(http::header::CONTENT_DISPOSITION, value);
    }
}

/// Set `X-Content-Type-Options: nosniff`.
pub(crate) fn set_nosniff(headers: &mut HeaderMap) {
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
}

/// Announce the trailer an archive body ends with when its writer fails.
///
/// HTTP/1 drops trailer fields the response head did not declare.
pub(crate) fn set_stream_trailer(headers: &mut HeaderMap) {
    headers.insert(TRAILER, HeaderValue::from_static("X-Stream-Error"));
}

/// Count archive streams that end with an error.
pub(crate) fn count_stream_failures(mut export: ExportStream, format: ResponseFormat) -> ExportStream {
    let (tx, rx) = oneshot::channel();
    let done = std::mem::replace(&mut export.done, rx);
    tokio::spawn(async move {
        let result = done.await.unwrap_or_else(|_| {
            Err(GatewayError::Internal(
                "stream writer exited without reporting".to_owned(),
            ))
        });
        if let Err(err) = &result {
            let label = format.to_string();
            STREAM_FAILURES.with_label_values(&[label.as_str()]).inc();
            warn!(%format, error = %err, "archive stream failed");
        }
        tx.send(result).ok();
    });
    export
}

/// Read a whole file into memory, refusing anything over `limit` bytes.
pub(crate) async fn read_to_bytes(file: FileContent, limit: u64) -> Result<Bytes, GatewayError> {
    if file.size > limit {
        return Err(GatewayError::Internal(format!(
            "file of {} bytes exceeds the {limit} byte limit",
            file.size
        )));
    }
    let mut data = Vec::with_capacity(usize::try_from(file.size).unwrap_or_default());
    let mut reader = file.reader;
    (&mut reader).take(limit).read_to_end(&mut data).await?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use cidgate_core::cids::{RAW, sha256_cid};

    use super::*;

    #[test]
    fn test_should_decode_query_params() {
        let q = QueryParams::parse(Some("filename=a%20b.txt&download=true&format="));
        assert_eq!(q.get("filename"), Some("a b.txt"));
        assert!(q.is_true("download"));
        assert_eq!(q.non_empty("format"), None);
        assert_eq!(QueryParams::parse(None).get("x"), None);
    }

    #[test]
    fn test_should_derive_etags_from_format_and_codec() {
        let file = sha256_cid(RAW, b"x");
        assert_eq!(etag_for(&file, ResponseFormat::Default), format!("\"{file}\""));
        assert_eq!(etag_for(&file, ResponseFormat::Raw), format!("\"{file}.raw\""));
        assert_eq!(etag_for(&file, ResponseFormat::Car), format!("W/\"{file}.car\""));
        let doc = sha256_cid(DAG_JSON, b"{}");
        assert_eq!(
            etag_for(&doc, ResponseFormat::Default),
            format!("\"{doc}.dag-json\"")
        );
    }

    #[test]
    fn test_should_limit_revalidation_to_renderer_etags() {
        let dir = sha256_cid(DAG_PB, b"dir");
        assert_eq!(
            candidate_etags(&dir, ResponseFormat::Car),
            vec![etag_for(&dir, ResponseFormat::Car)]
        );
        assert!(candidate_etags(&dir, ResponseFormat::Default).contains(&dir_index_etag(&dir)));
        assert!(!candidate_etags(&dir, ResponseFormat::Default).contains(&dag_index_etag(&dir)));

        let doc = sha256_cid(DAG_CBOR, b"doc");
        assert_eq!(
            candidate_etags(&doc, ResponseFormat::Default),
            vec![etag_for(&doc, ResponseFormat::Default), dag_index_etag(&doc)]
        );
        assert_eq!(candidate_etags(&doc, ResponseFormat::DagJson).len(), 1);
    }

    #[tokio::test]
    async fn test_should_refuse_to_buffer_oversized_files() {
        let file = FileContent::from_bytes(Bytes::from_static(b"0123456789"));
        assert!(read_to_bytes(file, 4).await.is_err());
        let file = FileContent::from_bytes(Bytes::from_static(b"0123"));
        assert_eq!(read_to_bytes(file, 4).await.unwrap(), Bytes::from_static(b"0123"));
    }
}
