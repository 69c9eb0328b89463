//! The gateway HTTP service implementing hyper's `Service` trait.
//!
//! [`GatewayService`] ties together hostname routing, path validation, format
//! negotiation, and the renderers. It handles:
//!
//! 1. Health check interception (`GET /health`)
//! 2. Prometheus metrics (`GET /metrics`)
//! 3. CORS preflight requests (`OPTIONS`)
//! 4. Protocol-handler redirects (`?uri=object://...`)
//! 5. Hostname routing via [`HostnameRouter`]
//! 6. Path checks (service worker scope, repeated namespaces, parsing)
//! 7. `Cache-Control: only-if-cached`
//! 8. Format negotiation and rendering
//! 9. Common response headers (`X-Request-Id`, `X-Object-Path`, CORS, configured headers)
//!
//! Every request runs under the configured timeout, and a panicking handler
//! is answered with a plain 500.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use cidgate_core::{ContentPath, GatewayBackend, GatewayError};
use futures::FutureExt;
use http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::Service;
use percent_encoding::percent_decode_str;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::body::GatewayBody;
use crate::config::GatewayConfig;
use crate::handlers::{self, QueryParams, RequestContext};
use crate::hostname::{HostnameGateways, HostnameRouter, Route, RouteRequest};
use crate::html;
use crate::metrics::{PANICS_RECOVERED, metrics_response, record_request, register_metrics};
use crate::negotiate::negotiate;
use crate::response::{
    TEXT_HTML, error_to_response, internal_error_response, redirect_response, text_response,
};

/// Header carrying the content path a response was produced for.
pub const OBJECT_PATH_HEADER: &str = "x-object-path";

/// Header carrying the per-request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

const EXPOSED_HEADERS: &str = "Content-Length, Content-Range, X-Roots, X-Stream-Error, \
                               X-Object-Path, X-Request-Id";

/// The gateway HTTP service.
///
/// Cloning is cheap: the backend, configuration, and hostname table are
/// shared.
pub struct GatewayService {
    backend: Arc<dyn GatewayBackend>,
    config: Arc<GatewayConfig>,
    router: Arc<HostnameRouter>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("config", &self.config)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl GatewayService {
    /// Create a service serving `backend` with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a wildcard hostname in the gateway table does not
    /// compile.
    pub fn new(backend: Arc<dyn GatewayBackend>, config: GatewayConfig) -> Result<Self, regex::Error> {
        let gateways = HostnameGateways::new(&config.public_gateways)?;
        let router = HostnameRouter::new(gateways, config.no_dnslink);
        register_metrics();
        Ok(Self {
            backend,
            config: Arc::new(config),
            router: Arc::new(router),
        })
    }

    /// The configuration this service was built with.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Answer one request. The request body is ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use cidgate_core::MemoryBackend;
    /// use cidgate_http::{GatewayConfig, GatewayService};
    ///
    /// # tokio_test::block_on(async {
    /// let backend = MemoryBackend::new();
    /// let cid = backend.add_file("hello");
    /// let service = GatewayService::new(Arc::new(backend), GatewayConfig::default()).unwrap();
    ///
    /// let req = http::Request::get(format!("/object/{cid}"))
    ///     .header("host", "127.0.0.1")
    ///     .body(())
    ///     .unwrap();
    /// let resp = service.handle(req).await;
    /// assert_eq!(resp.status(), http::StatusCode::OK);
    /// assert_eq!(resp.headers()["x-roots"], cid.to_string());
    /// # });
    /// ```
    pub async fn handle<B>(&self, req: http::Request<B>) -> Response<GatewayBody> {
        let (parts, _) = req.into_parts();
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut labels = RequestLabels::default();

        let outcome = AssertUnwindSafe(tokio::time::timeout(
            self.config.request_timeout,
            process_request(self, &parts, &request_id, &mut labels),
        ))
        .catch_unwind()
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(_elapsed)) => {
                warn!(uri = %parts.uri, request_id = %request_id, "request timed out");
                error_to_response(&GatewayError::DeadlineExceeded)
            }
            Err(_panic) => {
                PANICS_RECOVERED.inc();
                error!(uri = %parts.uri, request_id = %request_id, "request handler panicked");
                internal_error_response()
            }
        };

        if let Some(namespace) = labels.namespace {
            record_request(
                namespace,
                &labels.format,
                response.status(),
                started.elapsed().as_secs_f64(),
            );
        }

        add_common_headers(response, &request_id, &self.config, labels.content_path.as_deref())
    }
}

impl Clone for GatewayService {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
        }
    }
}

impl Service<http::Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

/// What a content request turned out to be, for metrics and headers.
#[derive(Debug, Default)]
struct RequestLabels {
    namespace: Option<&'static str>,
    format: String,
    content_path: Option<String>,
}

/// Process one request through the gateway pipeline.
async fn process_request(
    service: &GatewayService,
    parts: &http::request::Parts,
    request_id: &str,
    labels: &mut RequestLabels,
) -> Response<GatewayBody> {
    let method = &parts.method;
    let uri = &parts.uri;
    let config = service.config.as_ref();
    debug!(%method, %uri, request_id, "processing gateway request");

    // 1. Health check interception.
    if is_health_check(method, uri.path()) {
        return health_check_response();
    }

    // 1b. Prometheus metrics endpoint.
    if config.metrics_enabled && is_metrics_endpoint(method, uri.path()) {
        return metrics_response();
    }

    // 2. CORS preflight.
    if method == Method::OPTIONS {
        return cors_preflight_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed_response();
    }

    // 3. Protocol-handler redirect.
    let query = QueryParams::parse(uri.query());
    if let Some(target) = query.non_empty("uri") {
        return match protocol_redirect(target) {
            Ok(location) => redirect_response(StatusCode::MOVED_PERMANENTLY, &location),
            Err(err) => error_to_response(&err),
        };
    }

    // 4. Route by hostname.
    let host = effective_host(parts);
    let route_req = RouteRequest {
        host: &host,
        path: uri.path(),
        query: uri.query(),
        https: is_https(parts),
    };
    let routed = match service.router.route(service.backend.as_ref(), &route_req).await {
        Ok(Route::Serve(routed)) => routed,
        Ok(Route::Redirect(location)) => {
            debug!(%host, %location, request_id, "redirecting to canonical host");
            return redirect_response(StatusCode::MOVED_PERMANENTLY, &location);
        }
        Ok(Route::NotFound) => {
            debug!(%host, path = uri.path(), request_id, "host does not serve path");
            return text_response(StatusCode::NOT_FOUND, "404 page not found");
        }
        Err(err) => {
            warn!(%host, error = %err, request_id, "failed to route request");
            return error_to_response(&err);
        }
    };

    // 5. Path checks.
    if is_service_worker_registration(&parts.headers, &routed.path) {
        return error_to_response(&GatewayError::BadRequest(
            "navigator.serviceWorker: registration is not allowed for this scope".to_owned(),
        ));
    }
    if let Some(corrected) = superfluous_namespace(&routed.path, uri.query()) {
        return superfluous_namespace_response(&corrected);
    }
    let content_path = match decode_content_path(&routed.path) {
        Ok(path) => path,
        Err(err) => {
            debug!(path = %routed.path, error = %err, request_id, "invalid content path");
            return error_to_response(&err);
        }
    };
    labels.namespace = Some(content_path.namespace().as_str());
    labels.content_path = Some(content_path.to_string());
    info!(%host, path = %content_path, request_id, "routed gateway request");

    // 6. Offline lookups.
    let is_head = method == Method::HEAD;
    if only_if_cached(&parts.headers) {
        let cached = service.backend.is_cached(&content_path).await;
        if !cached {
            if is_head {
                return bare_response(StatusCode::PRECONDITION_FAILED);
            }
            return text_response(
                StatusCode::PRECONDITION_FAILED,
                &format!("{:?} not in local datastore", content_path.to_string()),
            );
        }
        if is_head {
            return bare_response(StatusCode::OK);
        }
    }

    // 7. Negotiate the representation.
    let accept = parts
        .headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok());
    let negotiated = match negotiate(query.get("format"), accept) {
        Ok(negotiated) => negotiated,
        Err(err) => return error_to_response(&err),
    };
    labels.format = negotiated.format.to_string();

    // 8. Render.
    let ctx = RequestContext {
        backend: service.backend.as_ref(),
        config,
        headers: &parts.headers,
        is_head,
        query: &query,
        raw_query: uri.query(),
        original_path: uri.path(),
        origin_isolated: routed.is_origin_isolated(),
        content_path,
        format: negotiated.format,
        format_params: negotiated.params,
    };
    let response = handlers::serve(&ctx).await;

    match routed.pending_redirect {
        Some(location) if response.status() == StatusCode::OK => {
            debug!(%location, request_id, "redirecting to subdomain gateway");
            redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
        }
        _ => response,
    }
}

/// Check if the request is a health check.
fn is_health_check(method: &Method, path: &str) -> bool {
    *method == Method::GET && (path == "/health" || path == "/_health")
}

/// Produce a health check response.
fn health_check_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(GatewayBody::from_string(
            r#"{"status":"running","service":"gateway"}"#,
        ))
        .expect("static health response should be valid")
}

/// Check if the request is a Prometheus metrics scrape.
fn is_metrics_endpoint(method: &Method, path: &str) -> bool {
    *method == Method::GET && path == "/metrics"
}

/// Produce a CORS preflight response. The allow-origin and configured
/// headers are added with the common headers.
fn cors_preflight_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Methods", ALLOWED_METHODS)
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type, Range, User-Agent, X-Requested-With",
        )
        .header("Access-Control-Max-Age", "86400")
        .body(GatewayBody::empty())
        .expect("static CORS response should be valid")
}

fn method_not_allowed_response() -> Response<GatewayBody> {
    let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    response
        .headers_mut()
        .insert(http::header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    response
}

fn bare_response(status: StatusCode) -> Response<GatewayBody> {
    let mut response = Response::new(GatewayBody::empty());
    *response.status_mut() = status;
    response
}

/// Turn `object://<root>/p?q` into `/object/<root>/p%3Fq`.
fn protocol_redirect(target: &str) -> Result<String, GatewayError> {
    let invalid = |reason: &str| {
        GatewayError::BadRequest(format!("uri query parameter {reason}: {target:?}"))
    };
    let (scheme, rest) = target
        .split_once("://")
        .or_else(|| target.split_once(':'))
        .ok_or_else(|| invalid("is not a URI"))?;
    if !matches!(scheme, "object" | "name") {
        return Err(GatewayError::BadRequest(
            "uri query parameter scheme must be object or name".to_owned(),
        ));
    }
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(invalid("has no root"));
    }

    let mut location = format!("/{scheme}/{rest}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        location.push_str("%3F");
        location.extend(percent_encoding::utf8_percent_encode(
            query,
            percent_encoding::NON_ALPHANUMERIC,
        ));
    }
    Ok(location)
}

/// `X-Forwarded-Host`, else `Host`, else the request URI authority.
fn effective_host(parts: &http::request::Parts) -> String {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    header("x-forwarded-host")
        .or_else(|| header(HOST.as_str()))
        .or_else(|| parts.uri.host())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn is_https(parts: &http::request::Parts) -> bool {
    parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || parts.uri.scheme_str() == Some("https"),
            |proto| proto.eq_ignore_ascii_case("https"),
        )
}

/// A `Service-Worker: script` registration scoped to a namespace root.
fn is_service_worker_registration(headers: &HeaderMap, path: &str) -> bool {
    let is_script = headers
        .get("service-worker")
        .is_some_and(|v| v.as_bytes() == b"script");
    if !is_script {
        return false;
    }
    let mut segments = path.trim_start_matches('/').split('/');
    let (Some(ns), Some(root), None) = (segments.next(), segments.next(), segments.next()) else {
        return false;
    };
    matches!(ns, "object" | "name") && !root.is_empty()
}

/// The corrected location for paths like `/object/object/<cid>`.
fn superfluous_namespace(path: &str, query: Option<&str>) -> Option<String> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let (Some(outer), Some(inner)) = (segments.next(), segments.next()) else {
        return None;
    };
    let is_namespace = |s: &str| matches!(s, "object" | "name");
    if !is_namespace(outer) || !is_namespace(inner) {
        return None;
    }
    let mut corrected = format!("/{inner}");
    if let Some(rest) = segments.next() {
        corrected.push('/');
        corrected.push_str(rest);
    }
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        corrected.push('?');
        corrected.push_str(query);
    }
    Some(corrected)
}

fn superfluous_namespace_response(corrected: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(CONTENT_TYPE, TEXT_HTML)
        .body(GatewayBody::from_string(html::superfluous_namespace(corrected)))
        .unwrap_or_else(|_| internal_error_response())
}

fn decode_content_path(raw: &str) -> Result<ContentPath, GatewayError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| GatewayError::InvalidPath {
            path: raw.to_owned(),
            reason: e.to_string(),
        })?;
    ContentPath::parse(&decoded)
}

fn only_if_cached(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("only-if-cached"))
}

/// Add common response headers to every gateway response.
fn add_common_headers(
    mut response: Response<GatewayBody>,
    request_id: &str,
    config: &GatewayConfig,
    content_path: Option<&str>,
) -> Response<GatewayBody> {
    let headers = response.headers_mut();

    if let Ok(hv) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, hv);
    }
    if let Some(hv) = content_path.and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(OBJECT_PATH_HEADER, hv);
    }

    // CORS headers for all responses
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers
        .entry("Access-Control-Allow-Methods")
        .or_insert(HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static(EXPOSED_HEADERS),
    );

    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid configured header"),
        }
    }

    response
}
