//! CARv1 exports.

use cidgate_core::{GatewayError, ImmutablePath};
use http::header::{ACCEPT_RANGES, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Response, StatusCode};

use super::{
    RequestContext, count_stream_failures, etag_for, respond, set_disposition, set_nosniff,
    set_roots_header, set_stream_trailer,
};
use crate::body::GatewayBody;
use crate::caching::set_cache_headers;
use crate::negotiate::ResponseFormat;

const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car; version=1";

pub(super) async fn serve_car(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    match ctx.format_params.get("version").map(String::as_str) {
        None | Some("1") => {}
        Some(_) => {
            return Err(GatewayError::BadRequest(
                "unsupported CAR version: only version=1 is supported".to_owned(),
            ));
        }
    }

    let (md, export) = if ctx.is_head {
        (ctx.backend.resolve_path(path).await?, None)
    } else {
        let (md, export) = ctx.backend.get_car(path).await?;
        (md, Some(export))
    };
    let cid = md.last_segment.cid;

    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, &md);
    let name = ctx
        .query
        .non_empty("filename")
        .map_or_else(|| format!("{cid}.car"), str::to_owned);
    set_disposition(&mut headers, "attachment", &name);
    set_cache_headers(
        &mut headers,
        &ctx.content_path,
        &etag_for(&cid, ResponseFormat::Car),
    );
    // Resuming a partial CAR means asking for a sub-DAG, not a byte range.
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CAR_CONTENT_TYPE));
    set_nosniff(&mut headers);
    set_stream_trailer(&mut headers);

    let body = export.map_or_else(GatewayBody::empty, |export| {
        GatewayBody::from_export(count_stream_failures(export, ResponseFormat::Car))
    });
    Ok(respond(StatusCode::OK, headers, body))
}
