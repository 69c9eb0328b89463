//! Prometheus metrics for the gateway.
//!
//! Metrics live in one process-wide [`REGISTRY`]; [`register_metrics`] is
//! idempotent and is called when a [`crate::GatewayService`] is built.

use std::sync::{LazyLock, Once};

use http::{Response, StatusCode};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::body::GatewayBody;

/// Global Prometheus registry for all gateway metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Responses by namespace, format, and status.
pub static REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gateway_requests_total",
            "Total content requests by namespace, response format, and status",
        ),
        &["namespace", "format", "status"],
    )
    .expect("metric creation failed")
});

/// Time to produce a response head.
pub static RESPONSE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "gateway_response_duration_seconds",
            "Time until the response head was ready, by response format",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0, 60.0]),
        &["format"],
    )
    .expect("metric creation failed")
});

/// CAR or TAR streams that ended with an error trailer.
pub static STREAM_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gateway_stream_failures_total",
            "Archive streams that failed after the response started",
        ),
        &["format"],
    )
    .expect("metric creation failed")
});

/// Panics caught at the dispatch boundary.
pub static PANICS_RECOVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gateway_panics_recovered_total",
        "Request handlers that panicked and were answered with 500",
    )
    .expect("metric creation failed")
});

/// Redirect rules applied from `_redirects` files.
pub static REDIRECT_RULES_APPLIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gateway_redirect_rules_applied_total",
            "Rules from _redirects files that matched, by status",
        ),
        &["status"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Subsequent calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RESPONSE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STREAM_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PANICS_RECOVERED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REDIRECT_RULES_APPLIED.clone()))
            .expect("metric registration failed");
    });
}

/// Render the registry in the text exposition format.
#[must_use]
pub fn metrics_response() -> Response<GatewayBody> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let (status, content_type, body) = match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain; charset=utf-8",
            format!("failed to encode metrics: {e}").into_bytes(),
        ),
    };
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(GatewayBody::from_bytes(body))
        .expect("metrics response should be valid")
}

/// Record one finished request.
pub fn record_request(namespace: &str, format: &str, status: StatusCode, elapsed_secs: f64) {
    REQUESTS
        .with_label_values(&[namespace, format, status.as_str()])
        .inc();
    RESPONSE_DURATION
        .with_label_values(&[format])
        .observe(elapsed_secs);
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_should_expose_registered_metrics() {
        register_metrics();
        register_metrics();
        record_request("object", "raw", StatusCode::OK, 0.01);
        let resp = metrics_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("gateway_requests_total"));
    }
}
