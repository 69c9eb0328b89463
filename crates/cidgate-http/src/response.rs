//! Response construction helpers.

use cidgate_core::GatewayError;
use http::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use http::{Response, StatusCode};

use crate::body::GatewayBody;

/// `Content-Type` of plain-text error bodies.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// `Content-Type` of generated HTML pages.
pub const TEXT_HTML: &str = "text/html; charset=utf-8";

/// Convert a [`GatewayError`] into a plain-text HTTP response.
///
/// The status comes from the error's kind. A retry hint becomes a
/// `Retry-After` header in whole seconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use cidgate_core::GatewayError;
/// use cidgate_http::response::error_to_response;
///
/// let err = GatewayError::Internal("busy".into()).with_retry_after(Duration::from_millis(2600));
/// let resp = error_to_response(&err);
/// assert_eq!(resp.status(), http::StatusCode::TOO_MANY_REQUESTS);
/// assert_eq!(resp.headers()["retry-after"], "3");
/// ```
#[must_use]
pub fn error_to_response(err: &GatewayError) -> Response<GatewayBody> {
    let mut builder = Response::builder()
        .status(err.status_code())
        .header(CONTENT_TYPE, TEXT_PLAIN)
        .header("X-Content-Type-Options", "nosniff");

    if let Some(retry_after) = err.retry_after() {
        let seconds = retry_after.as_secs_f64().round();
        builder = builder.header(RETRY_AFTER, format!("{seconds:.0}"));
    }

    builder
        .body(GatewayBody::from_string(format!("{err}\n")))
        .unwrap_or_else(|_| internal_error_response())
}

/// A plain-text response with `status`.
#[must_use]
pub fn text_response(status: StatusCode, message: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, TEXT_PLAIN)
        .body(GatewayBody::from_string(format!("{message}\n")))
        .unwrap_or_else(|_| internal_error_response())
}

/// A redirect to `location`.
///
/// Falls back to a plain 500 if `location` is not a valid header value.
#[must_use]
pub fn redirect_response(status: StatusCode, location: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .body(GatewayBody::empty())
        .unwrap_or_else(|_| internal_error_response())
}

/// The generic 500 used when request handling panicked or a response
/// could not be assembled.
#[must_use]
pub fn internal_error_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, TEXT_PLAIN)
        .body(GatewayBody::from_string("internal server error\n"))
        .expect("static internal error response should be valid")
}
