//! Signed naming records.

use cidgate_core::cids::{self, RAW};
use cidgate_core::{GatewayError, Namespace};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderValue};
use http::{HeaderMap, Response, StatusCode};

use super::{RequestContext, etag_for, respond, set_disposition, set_nosniff};
use crate::body::GatewayBody;
use crate::caching::set_last_modified_now;
use crate::negotiate::ResponseFormat;

/// Serve the record behind a key-based name. No resolution happens, so a
/// record is served even when it points nowhere reachable.
pub(super) async fn serve_naming_record(
    ctx: &RequestContext<'_>,
) -> Result<Response<GatewayBody>, GatewayError> {
    let path = &ctx.content_path;
    if path.namespace() != Namespace::Name {
        return Err(GatewayError::BadRequest(format!(
            "{path} is not a name path"
        )));
    }
    if !path.rest().is_empty() {
        return Err(GatewayError::BadRequest(
            "cannot find a naming record key for a sub-path".to_owned(),
        ));
    }
    let key = cids::name_key_cid(path.root()).ok_or_else(|| {
        GatewayError::BadRequest(format!("{:?} is not a key-based name", path.root()))
    })?;

    let record = ctx.backend.get_naming_record(&key).await?;

    let mut headers = HeaderMap::new();
    let etag = etag_for(&cids::sha256_cid(RAW, &record), ResponseFormat::NamingRecord);
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(ETAG, value);
    }
    set_last_modified_now(&mut headers);
    let name = ctx
        .query
        .non_empty("filename")
        .map_or_else(|| format!("{}.ipns-record", path.root()), str::to_owned);
    set_disposition(&mut headers, "attachment", &name);
    if let Some(media_type) = ResponseFormat::NamingRecord.media_type() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type));
    }
    set_nosniff(&mut headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(record.len()));

    let body = if ctx.is_head {
        GatewayBody::empty()
    } else {
        GatewayBody::from_bytes(record)
    };
    Ok(respond(StatusCode::OK, headers, body))
}
