//! The terminal block, verbatim.

use cidgate_core::{FileContent, GatewayError, ImmutablePath};
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Response, StatusCode};

use super::unixfs::serve_ranges;
use super::{RequestContext, etag_for, respond, set_disposition, set_nosniff, set_roots_header};
use crate::body::GatewayBody;
use crate::caching::{request_ranges, set_cache_headers};
use crate::negotiate::ResponseFormat;

const RAW_MEDIA_TYPE: &str = "application/vnd.ipld.raw";

pub(super) async fn serve_raw_block(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (md, data) = ctx.backend.get_block(path).await?;
    let cid = md.last_segment.cid;

    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, &md);
    let name = ctx
        .query
        .non_empty("filename")
        .map_or_else(|| format!("{cid}.bin"), str::to_owned);
    set_disposition(&mut headers, "attachment", &name);
    set_cache_headers(
        &mut headers,
        &ctx.content_path,
        &etag_for(&cid, ResponseFormat::Raw),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(RAW_MEDIA_TYPE));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    set_nosniff(&mut headers);

    if ctx.is_head {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
        return Ok(respond(StatusCode::OK, headers, GatewayBody::empty()));
    }
    let ranges = request_ranges(ctx.headers)?;
    serve_ranges(headers, FileContent::from_bytes(data), &ranges, RAW_MEDIA_TYPE).await
}
