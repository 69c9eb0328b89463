//! The default web representation: UnixFS files and directories.

use std::io::SeekFrom;

use bytes::{BufMut, BytesMut};
use cidgate_core::cids::is_structured_codec;
use cidgate_core::{
    ByteRange, DirectoryListing, FileContent, GatewayError, GetResponse, HeadResponse,
    ImmutablePath, PathMetadata,
};
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::{
    RequestContext, codec, etag_for, read_to_bytes, respond, set_disposition, set_roots_header,
};
use crate::body::GatewayBody;
use crate::caching::{dir_index_etag, request_ranges, set_cache_headers};
use crate::html::{self, DirectoryPage};
use crate::redirects::{self, Fallback};
use crate::response::{TEXT_HTML, redirect_response, text_response};

/// Bytes inspected when guessing a content type from the payload.
const SNIFF_LEN: usize = 512;

/// Largest structured-data block read into memory for conversion.
const MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

const INDEX_FILE: &str = "index.html";

pub(super) async fn serve_defaults(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    if ctx.is_head {
        return head_defaults(ctx, path).await;
    }

    let ranges = request_ranges(ctx.headers)?;
    let (served, md, content) = match ctx.backend.get(path, &ranges).await {
        Ok((md, content)) => (path.clone(), md, content),
        Err(err) => match redirects::handle_not_found(ctx, path, err).await? {
            Fallback::Respond(response) => return Ok(response),
            Fallback::Rewrite(target) => {
                debug!(from = %path, to = %target, "rewriting request");
                let (md, content) = ctx.backend.get(&target, &ranges).await?;
                (target, md, content)
            }
        },
    };

    match content {
        GetResponse::File(file) if is_structured_codec(md.last_segment.cid.codec()) => {
            let data = read_to_bytes(file, MAX_BLOCK_SIZE).await?;
            codec::render(ctx, &md, &data)
        }
        GetResponse::File(file) => {
            let name = file_name(ctx, &served);
            serve_file(ctx, &md, &name, file, &ranges).await
        }
        GetResponse::Directory(listing) => {
            let dag_size = listing.dag_size;
            serve_directory(ctx, &served, &md, Some(listing), dag_size).await
        }
    }
}

async fn head_defaults(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (served, md, head) = match ctx.backend.head(path).await {
        Ok((md, head)) => (path.clone(), md, head),
        Err(err) => match redirects::handle_not_found(ctx, path, err).await? {
            Fallback::Respond(response) => return Ok(response),
            Fallback::Rewrite(target) => {
                let (md, head) = ctx.backend.head(&target).await?;
                (target, md, head)
            }
        },
    };

    match head {
        HeadResponse::File { .. } if is_structured_codec(md.last_segment.cid.codec()) => {
            let (md, data) = ctx.backend.get_block(&served).await?;
            codec::render(ctx, &md, &data)
        }
        HeadResponse::File { size, start } => {
            let name = file_name(ctx, &served);
            Ok(head_file(ctx, &md, &name, size, &start))
        }
        HeadResponse::Directory { dag_size } => {
            serve_directory(ctx, &served, &md, None, dag_size).await
        }
    }
}

/// Name used for the content type guess and the default download name.
fn file_name(ctx: &RequestContext<'_>, served: &ImmutablePath) -> String {
    ctx.query.non_empty("filename").map_or_else(
        || {
            served
                .as_content_path()
                .segments()
                .last()
                .cloned()
                .unwrap_or_default()
        },
        str::to_owned,
    )
}

/// Headers shared by full, ranged, and HEAD file responses.
fn file_headers(ctx: &RequestContext<'_>, md: &PathMetadata, name: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, md);
    set_cache_headers(
        &mut headers,
        &ctx.content_path,
        &etag_for(&md.last_segment.cid, ctx.format),
    );
    let download = ctx.query.is_true("download");
    if download || ctx.query.non_empty("filename").is_some() {
        let disposition = if download { "attachment" } else { "inline" };
        set_disposition(&mut headers, disposition, name);
    }
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

fn empty_file(mut headers: HeaderMap) -> Response<GatewayBody> {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    respond(StatusCode::OK, headers, GatewayBody::empty())
}

fn head_file(
    ctx: &RequestContext<'_>,
    md: &PathMetadata,
    name: &str,
    size: u64,
    start: &[u8],
) -> Response<GatewayBody> {
    let mut headers = file_headers(ctx, md, name);
    if size == 0 {
        return empty_file(headers);
    }
    let content_type = declared_type(name, md).unwrap_or_else(|| sniff(start).to_owned());
    insert_content_type(&mut headers, &content_type);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    respond(StatusCode::OK, headers, GatewayBody::empty())
}

async fn serve_file(
    ctx: &RequestContext<'_>,
    md: &PathMetadata,
    name: &str,
    mut file: FileContent,
    ranges: &[ByteRange],
) -> Result<Response<GatewayBody>, GatewayError> {
    let mut headers = file_headers(ctx, md, name);
    if file.size == 0 {
        return Ok(empty_file(headers));
    }

    let content_type = match declared_type(name, md) {
        Some(content_type) => content_type,
        None => {
            let len = usize::try_from(file.size).map_or(SNIFF_LEN, |s| s.min(SNIFF_LEN));
            let mut start = vec![0; len];
            file.reader.read_exact(&mut start).await?;
            file.reader.seek(SeekFrom::Start(0)).await?;
            sniff(&start).to_owned()
        }
    };
    insert_content_type(&mut headers, &content_type);
    serve_ranges(headers, file, ranges, &content_type).await
}

/// Content type from the file extension, then the backend's hint.
fn declared_type(name: &str, md: &PathMetadata) -> Option<String> {
    mime_guess::from_path(name)
        .first_raw()
        .map(str::to_owned)
        .or_else(|| md.content_type.clone())
}

fn insert_content_type(headers: &mut HeaderMap, content_type: &str) {
    // Browsers pick the charset of HTML themselves.
    let content_type = if content_type.starts_with("text/html;") {
        "text/html"
    } else {
        content_type
    };
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
}

/// Guess a content type from leading bytes.
fn sniff(data: &[u8]) -> &'static str {
    const SIGNATURES: [(&[u8], &str); 9] = [
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\x1f\x8b\x08", "application/gzip"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x00asm", "application/wasm"),
        (b"OggS", "application/ogg"),
    ];
    if let Some(&(_, content_type)) = SIGNATURES.iter().find(|(sig, _)| data.starts_with(sig)) {
        return content_type;
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }

    let text = data.trim_ascii_start();
    let lower: Vec<u8> = text.iter().take(16).map(u8::to_ascii_lowercase).collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return "text/html; charset=utf-8";
    }
    if lower.starts_with(b"<svg") {
        return "image/svg+xml";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if is_text(data) {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

fn is_text(data: &[u8]) -> bool {
    let valid = match std::str::from_utf8(data) {
        Ok(_) => true,
        // A multi-byte character cut off by the sniff window.
        Err(e) => e.error_len().is_none(),
    };
    valid
        && !data
            .iter()
            .any(|b| b.is_ascii_control() && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
}

/// Write the full file, a single range, or a multipart response.
pub(super) async fn serve_ranges(
    mut headers: HeaderMap,
    mut file: FileContent,
    ranges: &[ByteRange],
    content_type: &str,
) -> Result<Response<GatewayBody>, GatewayError> {
    let size = file.size;
    if ranges.is_empty() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
        return Ok(respond(
            StatusCode::OK,
            headers,
            GatewayBody::from_reader(file.reader),
        ));
    }

    let resolved: Vec<(u64, u64)> = ranges.iter().filter_map(|r| r.resolve(size)).collect();
    if resolved.is_empty() {
        let mut response = text_response(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "invalid range: failed to overlap",
        );
        if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
            response.headers_mut().insert(CONTENT_RANGE, value);
        }
        return Ok(response);
    }

    // Overlapping ranges asking for more than the file: send it whole.
    let total: u64 = resolved.iter().map(|(start, end)| end - start + 1).sum();
    if total > size {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
        return Ok(respond(
            StatusCode::OK,
            headers,
            GatewayBody::from_reader(file.reader),
        ));
    }

    if let [(start, end)] = resolved[..] {
        let len = end - start + 1;
        file.reader.seek(SeekFrom::Start(start)).await?;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
            headers.insert(CONTENT_RANGE, value);
        }
        return Ok(respond(
            StatusCode::PARTIAL_CONTENT,
            headers,
            GatewayBody::from_reader(file.reader.take(len)),
        ));
    }

    let boundary = uuid::Uuid::new_v4().simple().to_string();
    let mut body = BytesMut::new();
    for (i, (start, end)) in resolved.iter().enumerate() {
        let mut part = String::new();
        if i > 0 {
            part.push_str("\r\n");
        }
        part.push_str(&format!(
            "--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: bytes {start}-{end}/{size}\r\n\r\n"
        ));
        body.put_slice(part.as_bytes());

        let len = usize::try_from(end - start + 1)
            .map_err(|e| GatewayError::Internal(format!("range too large: {e}")))?;
        let mut chunk = vec![0; len];
        file.reader.seek(SeekFrom::Start(*start)).await?;
        file.reader.read_exact(&mut chunk).await?;
        body.put_slice(&chunk);
    }
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    if let Ok(value) =
        HeaderValue::from_str(&format!("multipart/byteranges; boundary={boundary}"))
    {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok(respond(
        StatusCode::PARTIAL_CONTENT,
        headers,
        GatewayBody::from_bytes(body.freeze()),
    ))
}

/// Serve a directory: redirect to the slash form, then its index document,
/// then a generated listing. `listing` is `None` for HEAD.
async fn serve_directory(
    ctx: &RequestContext<'_>,
    served: &ImmutablePath,
    md: &PathMetadata,
    listing: Option<DirectoryListing>,
    dag_size: Option<u64>,
) -> Result<Response<GatewayBody>, GatewayError> {
    if !ctx.original_path.ends_with('/') && ctx.query.get("go-get") != Some("1") {
        let mut location = format!("{}/", ctx.original_path);
        if let Some(query) = ctx.raw_query.filter(|q| !q.is_empty()) {
            location.push('?');
            location.push_str(query);
        }
        return Ok(redirect_response(StatusCode::MOVED_PERMANENTLY, &location));
    }

    let index = served.join(INDEX_FILE);
    let name = ctx
        .query
        .non_empty("filename")
        .unwrap_or(INDEX_FILE)
        .to_owned();
    if ctx.is_head {
        match ctx.backend.head(&index).await {
            Ok((_, HeadResponse::File { size, start })) => {
                return Ok(head_file(ctx, md, &name, size, &start));
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    } else {
        let ranges = request_ranges(ctx.headers)?;
        match ctx.backend.get(&index, &ranges).await {
            Ok((_, GetResponse::File(file))) => {
                return serve_file(ctx, md, &name, file, &ranges).await;
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    let cid = md.last_segment.cid;
    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, md);
    set_cache_headers(&mut headers, &ctx.content_path, &dir_index_etag(&cid));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_HTML));

    let Some(listing) = listing else {
        return Ok(respond(StatusCode::OK, headers, GatewayBody::empty()));
    };
    let entries = listing.entries.collect().await?;
    let content_path = ctx.content_path.to_string();
    let page = html::directory_listing(&DirectoryPage {
        content_path: &content_path,
        base_href: ctx.original_path,
        cid: &cid,
        dag_size,
        entries: &entries,
        back_link: !ctx.content_path.rest().is_empty(),
    });
    Ok(respond(StatusCode::OK, headers, GatewayBody::from_string(page)))
}
