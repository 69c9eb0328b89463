//! Structured-data blocks: passthrough, conversion between the DAG codecs,
//! and the HTML summary for browsers.

use cidgate_core::cids::{CBOR, DAG_CBOR, DAG_JSON, JSON, codec_name};
use cidgate_core::{Cid, GatewayError, ImmutablePath, PathMetadata, codec};
use http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderValue};
use http::{HeaderMap, Response, StatusCode};

use super::{RequestContext, etag_for, respond, set_disposition, set_nosniff, set_roots_header};
use crate::body::GatewayBody;
use crate::caching::{dag_index_etag, set_cache_headers};
use crate::html;
use crate::negotiate::ResponseFormat;
use crate::response::TEXT_HTML;

pub(super) async fn serve_codec(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (md, data) = ctx.backend.get_block(path).await?;
    render(ctx, &md, &data)
}

/// Render the terminal block of `md` in the negotiated format.
pub(super) fn render(
    ctx: &RequestContext<'_>,
    md: &PathMetadata,
    data: &[u8],
) -> Result<Response<GatewayBody>, GatewayError> {
    let resolved = &md.last_segment;
    if !resolved.remainder.is_empty() {
        return Err(GatewayError::Unimplemented(format!(
            "{:?} of {} could not be returned: reading structured data kinds other than links is not implemented",
            resolved.remainder, ctx.content_path
        )));
    }

    let cid = resolved.cid;
    let source = cid.codec();
    let target = match ctx.format {
        ResponseFormat::Default => ResponseFormat::for_codec(source).ok_or_else(|| {
            GatewayError::Internal(format!("content type not found for codec {}", codec_name(source)))
        })?,
        explicit => explicit,
    };

    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, md);
    set_cache_headers(&mut headers, &ctx.content_path, &etag_for(&cid, ctx.format));
    set_codec_disposition(ctx, &mut headers, &cid, target);
    if let Some(media_type) = target.media_type() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type));
    }
    set_nosniff(&mut headers);

    if ctx.format == ResponseFormat::Default {
        let wants_html = ctx.accept().any(|accept| accept.contains("text/html"));
        if matches!(source, DAG_JSON | DAG_CBOR) && wants_html && !ctx.query.is_true("download") {
            return html_view(ctx, headers, &cid, source, data);
        }
        return Ok(body_response(ctx, headers, data.to_vec()));
    }

    let passthrough = match ctx.format {
        ResponseFormat::Json => matches!(source, JSON | DAG_JSON),
        ResponseFormat::Cbor => matches!(source, CBOR | DAG_CBOR),
        _ => false,
    };
    if passthrough {
        return Ok(body_response(ctx, headers, data.to_vec()));
    }

    match target {
        ResponseFormat::DagJson | ResponseFormat::DagCbor => {
            let to = target.codec().ok_or_else(|| {
                GatewayError::Internal(format!("no codec for {target}"))
            })?;
            let node = codec::decode(source, data)?;
            let converted = codec::encode(to, &node)?;
            Ok(body_response(ctx, headers, converted))
        }
        other => Err(GatewayError::BadRequest(format!(
            "converting from {} to {other} is not supported",
            codec_name(source)
        ))),
    }
}

fn body_response(
    ctx: &RequestContext<'_>,
    mut headers: HeaderMap,
    data: Vec<u8>,
) -> Response<GatewayBody> {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
    let body = if ctx.is_head {
        GatewayBody::empty()
    } else {
        GatewayBody::from_bytes(data)
    };
    respond(StatusCode::OK, headers, body)
}

/// JSON is shown inline, everything else downloads, unless `download=true`.
fn set_codec_disposition(
    ctx: &RequestContext<'_>,
    headers: &mut HeaderMap,
    cid: &Cid,
    format: ResponseFormat,
) {
    let ext = match format {
        ResponseFormat::Json | ResponseFormat::DagJson => ".json",
        _ => ".cbor",
    };
    let name = ctx
        .query
        .non_empty("filename")
        .map_or_else(|| format!("{cid}{ext}"), str::to_owned);
    let disposition = if ctx.query.is_true("download") || ext != ".json" {
        "attachment"
    } else {
        "inline"
    };
    set_disposition(headers, disposition, &name);
}

fn html_view(
    ctx: &RequestContext<'_>,
    mut headers: HeaderMap,
    cid: &Cid,
    source: u64,
    data: &[u8],
) -> Result<Response<GatewayBody>, GatewayError> {
    headers.remove(CONTENT_DISPOSITION);
    headers.remove(CACHE_CONTROL);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_HTML));
    if let Ok(value) = HeaderValue::from_str(&dag_index_etag(cid)) {
        headers.insert(ETAG, value);
    }
    if ctx.is_head {
        return Ok(respond(StatusCode::OK, headers, GatewayBody::empty()));
    }

    let node = codec::decode(source, data)?;
    let json = codec::encode(DAG_JSON, &node)?;
    let preview = serde_json::from_slice::<serde_json::Value>(&json)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| String::from_utf8_lossy(&json).into_owned());
    let page = html::dag_index(
        &ctx.content_path.to_string(),
        cid,
        codec_name(source),
        &preview,
    );
    Ok(respond(StatusCode::OK, headers, GatewayBody::from_string(page)))
}
