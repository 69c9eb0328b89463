//! Hostname routing.
//!
//! Maps the effective host of a request onto a content path:
//!
//! 1. A known gateway hostname serves its configured path prefixes. With
//!    subdomains enabled, path requests are additionally pointed at the
//!    matching `{root}.{namespace}.{gateway}` origin.
//! 2. `{root}.{namespace}.{gateway}` on a known subdomain gateway is
//!    canonicalized and rewritten to `/{namespace}/{root}/...`.
//! 3. Any other host with a DNS link record is served from `/name/{host}`.
//! 4. Everything else passes through unchanged.
//!
//! The hostname table is built once and only read afterwards.

use std::collections::HashMap;

use cidgate_core::cids::{name_dns_label, name_key_cid, object_dns_label, parse_cid, parse_peer_id};
use cidgate_core::{GatewayBackend, GatewayError, Namespace};
use regex::Regex;
use tracing::debug;

use crate::config::{GatewaySpec, default_gateways};

/// Longest DNS name.
const DNS_NAME_MAX_LENGTH: usize = 253;

/// Longest DNS label.
const DNS_LABEL_MAX_LENGTH: usize = cidgate_core::cids::DNS_LABEL_MAX_LENGTH;

#[derive(Debug, Clone)]
struct WildcardGateway {
    pattern: Regex,
    spec: GatewaySpec,
}

/// Known gateway hostnames, split into exact names and `*.domain` patterns.
#[derive(Debug, Clone)]
pub struct HostnameGateways {
    exact: HashMap<String, GatewaySpec>,
    wildcard: Vec<WildcardGateway>,
}

/// A request host recognized as `{root}.{namespace}.{gateway}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdomainMatch<'a> {
    /// The gateway's configuration.
    pub spec: &'a GatewaySpec,
    /// The gateway hostname, port included when the request had one.
    pub gateway: String,
    /// Namespace label.
    pub namespace: Namespace,
    /// Everything left of the namespace label.
    pub root: String,
}

impl HostnameGateways {
    /// Merge `overrides` into the default table. A `None` entry removes a
    /// default hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if a wildcard hostname does not compile to a regex.
    pub fn new(overrides: &HashMap<String, Option<GatewaySpec>>) -> Result<Self, regex::Error> {
        let mut table = default_gateways();
        for (host, spec) in overrides {
            match spec {
                Some(spec) => table.insert(host.clone(), spec.clone()),
                None => table.remove(host),
            };
        }

        let mut exact = HashMap::new();
        let mut wildcard = Vec::new();
        for (host, spec) in table {
            if host.contains('*') {
                let escaped: Vec<String> = host.split('*').map(regex::escape).collect();
                let pattern = Regex::new(&format!("^{}(?::\\d+)?$", escaped.join("[^.]+")))?;
                wildcard.push(WildcardGateway { pattern, spec });
            } else {
                exact.insert(host, spec);
            }
        }
        Ok(Self { exact, wildcard })
    }

    /// The configuration of a gateway hostname, with or without a port.
    #[must_use]
    pub fn lookup(&self, host: &str) -> Option<&GatewaySpec> {
        self.exact
            .get(host)
            .or_else(|| self.exact.get(strip_port(host)))
            .or_else(|| {
                self.wildcard
                    .iter()
                    .find(|w| w.pattern.is_match(host))
                    .map(|w| &w.spec)
            })
    }

    /// Recognize `{root}.{namespace}.{gateway}`, trying the shortest gateway
    /// suffix first.
    #[must_use]
    pub fn subdomain(&self, host: &str) -> Option<SubdomainMatch<'_>> {
        let labels: Vec<&str> = host.split('.').collect();
        for i in (2..labels.len()).rev() {
            let gateway = labels[i..].join(".");
            let Some(spec) = self.lookup(&gateway) else {
                continue;
            };
            let Ok(namespace) = labels[i - 1].parse::<Namespace>() else {
                continue;
            };
            return Some(SubdomainMatch {
                spec,
                gateway,
                namespace,
                root: labels[..i - 1].join("."),
            });
        }
        None
    }
}

/// Where a routed request goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve `path` on this gateway.
    Serve(Routed),
    /// Answer with a permanent redirect.
    Redirect(String),
    /// The host does not serve this path.
    NotFound,
}

/// A request accepted by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routed {
    /// Path to serve, possibly rewritten.
    pub path: String,
    /// Subdomain gateway the request arrived on.
    pub subdomain_hostname: Option<String>,
    /// Host whose DNS link record roots the request.
    pub dnslink_hostname: Option<String>,
    /// `Location` to send with a `301` if the content would otherwise be
    /// served with `200`.
    pub pending_redirect: Option<String>,
}

impl Routed {
    fn passthrough(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            ..Self::default()
        }
    }

    fn dnslink(host: &str, path: &str) -> Self {
        Self {
            path: format!("/name/{}{path}", strip_port(host)),
            dnslink_hostname: Some(host.to_owned()),
            ..Self::default()
        }
    }

    /// Whether the content is served from an origin of its own.
    #[must_use]
    pub fn is_origin_isolated(&self) -> bool {
        self.subdomain_hostname.is_some() || self.dnslink_hostname.is_some()
    }
}

/// The parts of a request the router looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    /// Effective host: `X-Forwarded-Host`, else `Host`.
    pub host: &'a str,
    /// Request path as sent.
    pub path: &'a str,
    /// Raw query string.
    pub query: Option<&'a str>,
    /// Whether the client connected over TLS (per `X-Forwarded-Proto`).
    pub https: bool,
}

/// Routes requests by hostname.
#[derive(Debug, Clone)]
pub struct HostnameRouter {
    gateways: HostnameGateways,
    no_dnslink: bool,
}

impl HostnameRouter {
    /// Create a router over `gateways`; `no_dnslink` disables DNS link
    /// lookups for unknown hosts.
    #[must_use]
    pub fn new(gateways: HostnameGateways, no_dnslink: bool) -> Self {
        Self {
            gateways,
            no_dnslink,
        }
    }

    /// Decide how to serve `req`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BadRequest`] when a root cannot be expressed
    /// as a DNS label.
    pub async fn route(
        &self,
        backend: &dyn GatewayBackend,
        req: &RouteRequest<'_>,
    ) -> Result<Route, GatewayError> {
        if let Some(spec) = self.gateways.lookup(req.host) {
            if has_prefix(req.path, &spec.paths) {
                let mut routed = Routed::passthrough(req.path);
                if spec.use_subdomains {
                    routed.pending_redirect =
                        to_subdomain_url(backend, req, spec.inline_dnslink).await?;
                }
                return Ok(Route::Serve(routed));
            }
            if !spec.no_dnslink && has_dnslink_record(backend, req.host).await {
                return Ok(Route::Serve(Routed::dnslink(req.host, req.path)));
            }
            return Ok(Route::NotFound);
        }

        if let Some(sub) = self.gateways.subdomain(req.host) {
            return route_subdomain(backend, req, &sub).await;
        }

        if !self.no_dnslink && has_dnslink_record(backend, req.host).await {
            return Ok(Route::Serve(Routed::dnslink(req.host, req.path)));
        }

        Ok(Route::Serve(Routed::passthrough(req.path)))
    }
}

async fn route_subdomain(
    backend: &dyn GatewayBackend,
    req: &RouteRequest<'_>,
    sub: &SubdomainMatch<'_>,
) -> Result<Route, GatewayError> {
    let ns = sub.namespace;
    let prefix = format!("/{ns}/{}", sub.root);
    if !sub.spec.use_subdomains || !has_prefix(&prefix, &sub.spec.paths) {
        return Ok(Route::NotFound);
    }

    let canonical = match ns {
        Namespace::Object => match parse_cid(&sub.root) {
            Ok(cid) => Some(object_dns_label(&cid)?),
            Err(_) => None,
        },
        Namespace::Name => name_key_cid(&sub.root)
            .map(|key| name_dns_label(&key))
            .transpose()?,
    };
    if let Some(canonical) = canonical.filter(|c| *c != sub.root) {
        debug!(root = %sub.root, %canonical, "redirecting to canonical subdomain");
        let url = subdomain_url(req, &canonical, ns, &sub.gateway, req.path)?;
        return Ok(Route::Redirect(url));
    }

    let mut root = sub.root.clone();
    if ns == Namespace::Name
        && !root.contains('.')
        && name_key_cid(&root).is_none()
        && !has_dnslink_record(backend, &root).await
    {
        let fqdn = dnslink_fqdn(&root);
        if has_dnslink_record(backend, &fqdn).await {
            root = fqdn;
        }
    }

    Ok(Route::Serve(Routed {
        path: format!("/{ns}/{root}{}", req.path),
        subdomain_hostname: Some(sub.gateway.clone()),
        ..Routed::default()
    }))
}

/// The subdomain URL serving the same content as a path request, if the
/// path names a namespace root.
async fn to_subdomain_url(
    backend: &dyn GatewayBackend,
    req: &RouteRequest<'_>,
    inline_dnslink: bool,
) -> Result<Option<String>, GatewayError> {
    let mut parts = req.path.splitn(4, '/').skip(1);
    let (Some(ns), Some(root)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let Ok(ns) = ns.parse::<Namespace>() else {
        return Ok(None);
    };
    if root.is_empty() {
        return Ok(None);
    }
    let rest = format!("/{}", parts.next().unwrap_or_default());

    let label = match ns {
        Namespace::Object => match parse_cid(root) {
            Ok(cid) => object_dns_label(&cid)?,
            Err(_) => return Ok(None),
        },
        Namespace::Name => {
            if let Some(key) = name_key_cid(root) {
                name_dns_label(&key)?
            } else if (inline_dnslink || req.https)
                && root.contains('.')
                && has_dnslink_record(backend, root).await
            {
                dnslink_label(root)?
            } else {
                root.to_owned()
            }
        }
    };

    subdomain_url(req, &label, ns, req.host, &rest).map(Some)
}

fn subdomain_url(
    req: &RouteRequest<'_>,
    label: &str,
    ns: Namespace,
    gateway: &str,
    path: &str,
) -> Result<String, GatewayError> {
    let scheme = if req.https { "https" } else { "http" };
    let mut raw = format!("{scheme}://{label}.{ns}.{gateway}{path}");
    if let Some(query) = req.query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(query);
    }
    url::Url::parse(&raw)
        .map(|u| u.to_string())
        .map_err(|e| GatewayError::BadRequest(format!("invalid redirect url {raw:?}: {e}")))
}

/// Whether `path` equals one of `prefixes` or continues it with `/`.
///
/// # Examples
///
/// ```
/// use cidgate_http::hostname::has_prefix;
///
/// let prefixes = vec!["/object/".to_owned()];
/// assert!(has_prefix("/object/bafy", &prefixes));
/// assert!(has_prefix("/object", &prefixes));
/// assert!(!has_prefix("/objects", &prefixes));
/// ```
#[must_use]
pub fn has_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Drop a trailing `:port`, unwrapping bracketed IPv6 literals.
#[must_use]
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(h, _)| h);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Fold a dotted DNS link name into one label: `-` becomes `--` and `.`
/// becomes `-`.
///
/// # Errors
///
/// Returns [`GatewayError::BadRequest`] if the result is too long for a DNS
/// label.
pub fn dnslink_label(fqdn: &str) -> Result<String, GatewayError> {
    let label = fqdn.replace('-', "--").replace('.', "-");
    if label.len() > DNS_LABEL_MAX_LENGTH {
        return Err(GatewayError::BadRequest(format!(
            "DNSLink representation incompatible with DNS label length limit of {DNS_LABEL_MAX_LENGTH}: {label}"
        )));
    }
    Ok(label)
}

/// Reverse of [`dnslink_label`].
#[must_use]
pub fn dnslink_fqdn(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut chars = label.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '-' {
            out.push(c);
        } else if chars.peek() == Some(&'-') {
            chars.next();
            out.push('-');
        } else {
            out.push('.');
        }
    }
    out
}

fn is_domain_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.len() <= DNS_NAME_MAX_LENGTH
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= DNS_LABEL_MAX_LENGTH
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

async fn has_dnslink_record(backend: &dyn GatewayBackend, host: &str) -> bool {
    let name = strip_port(host);
    if parse_peer_id(name).is_some() || !is_domain_name(name) {
        return false;
    }
    backend.get_name_record_by_host(name).await.is_ok()
}

#[cfg(test)]
mod tests {
    use cidgate_core::cids::{RAW, identity_cid, sha256_cid};
    use cidgate_core::{ContentPath, MemoryBackend};

    use super::*;

    fn router(overrides: &[(&str, Option<GatewaySpec>)]) -> HostnameRouter {
        let overrides: HashMap<String, Option<GatewaySpec>> = overrides
            .iter()
            .map(|(h, s)| ((*h).to_owned(), s.clone()))
            .collect();
        HostnameRouter::new(HostnameGateways::new(&overrides).unwrap(), false)
    }

    fn request<'a>(host: &'a str, path: &'a str) -> RouteRequest<'a> {
        RouteRequest {
            host,
            path,
            query: None,
            https: false,
        }
    }

    fn serve(route: Route) -> Routed {
        match route {
            Route::Serve(routed) => routed,
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn test_should_strip_ports() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn test_should_round_trip_dnslink_labels() {
        let label = dnslink_label("my.v-long.example.com").unwrap();
        assert_eq!(label, "my-v--long-example-com");
        assert_eq!(dnslink_fqdn(&label), "my.v-long.example.com");
    }

    #[test]
    fn test_should_reject_overlong_dnslink_labels() {
        let fqdn = format!("{}.example.com", "a".repeat(60));
        assert!(dnslink_label(&fqdn).is_err());
    }

    #[test]
    fn test_should_match_wildcard_hostnames_with_ports() {
        let gateways =
            HostnameGateways::new(&HashMap::from([("*.example.com".to_owned(), Some(GatewaySpec::path()))]))
                .unwrap();
        assert!(gateways.lookup("gw.example.com").is_some());
        assert!(gateways.lookup("gw.example.com:443").is_some());
        assert!(gateways.lookup("a.b.example.com").is_none());
        assert!(gateways.lookup("localhost:8080").is_some());
    }

    #[test]
    fn test_should_remove_default_hostnames() {
        let gateways = HostnameGateways::new(&HashMap::from([("localhost".to_owned(), None)])).unwrap();
        assert!(gateways.lookup("localhost").is_none());
    }

    #[test]
    fn test_should_find_subdomain_details() {
        let gateways = HostnameGateways::new(&HashMap::from([(
            "dweb.link".to_owned(),
            Some(GatewaySpec::subdomain()),
        )]))
        .unwrap();
        let sub = gateways.subdomain("docs.example.com.name.dweb.link").unwrap();
        assert_eq!(sub.gateway, "dweb.link");
        assert_eq!(sub.namespace, Namespace::Name);
        assert_eq!(sub.root, "docs.example.com");
        assert!(gateways.subdomain("bafy.other.dweb.link").is_none());
    }

    #[tokio::test]
    async fn test_should_pass_through_unknown_hosts() {
        let backend = MemoryBackend::new();
        let route = router(&[])
            .route(&backend, &request("unknown.test", "/object/x"))
            .await
            .unwrap();
        let routed = serve(route);
        assert_eq!(routed.path, "/object/x");
        assert!(!routed.is_origin_isolated());
    }

    #[tokio::test]
    async fn test_should_serve_paths_on_path_gateways() {
        let backend = MemoryBackend::new();
        let routed = serve(
            router(&[])
                .route(&backend, &request("127.0.0.1:8080", "/object/bafy"))
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, "/object/bafy");
        assert!(routed.pending_redirect.is_none());
        assert!(!routed.is_origin_isolated());
    }

    #[tokio::test]
    async fn test_should_return_not_found_for_unserved_paths() {
        let backend = MemoryBackend::new();
        let route = router(&[])
            .route(&backend, &request("127.0.0.1", "/elsewhere"))
            .await
            .unwrap();
        assert_eq!(route, Route::NotFound);
    }

    #[tokio::test]
    async fn test_should_point_path_requests_at_subdomains() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"x");
        let path = format!("/object/{cid}/a.txt");
        let req = RouteRequest {
            query: Some("download=true"),
            ..request("localhost:8080", &path)
        };
        let routed = serve(router(&[]).route(&backend, &req).await.unwrap());
        assert_eq!(
            routed.pending_redirect.as_deref(),
            Some(format!("http://{cid}.object.localhost:8080/a.txt?download=true").as_str())
        );
    }

    #[tokio::test]
    async fn test_should_upgrade_cidv0_in_subdomain_redirects() {
        let backend = MemoryBackend::new();
        let v1 = sha256_cid(cidgate_core::cids::DAG_PB, b"dir");
        let v0 = cidgate_core::Cid::new_v0(*v1.hash()).unwrap();
        let path = format!("/object/{v0}");
        let routed = serve(
            router(&[])
                .route(&backend, &request("localhost", &path))
                .await
                .unwrap(),
        );
        assert_eq!(
            routed.pending_redirect.as_deref(),
            Some(format!("http://{v1}.object.localhost/").as_str())
        );
    }

    #[tokio::test]
    async fn test_should_rewrite_subdomain_requests() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"x");
        let host = format!("{cid}.object.localhost:8080");
        let routed = serve(
            router(&[])
                .route(&backend, &request(&host, "/a/b"))
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, format!("/object/{cid}/a/b"));
        assert_eq!(routed.subdomain_hostname.as_deref(), Some("localhost:8080"));
        assert!(routed.is_origin_isolated());
    }

    #[tokio::test]
    async fn test_should_redirect_non_canonical_subdomain_roots() {
        let backend = MemoryBackend::new();
        let v1 = sha256_cid(cidgate_core::cids::DAG_PB, b"dir");
        let v0 = cidgate_core::Cid::new_v0(*v1.hash()).unwrap();
        let host = format!("{v0}.object.localhost");
        let route = router(&[])
            .route(&backend, &request(&host, "/p"))
            .await
            .unwrap();
        assert_eq!(
            route,
            Route::Redirect(format!("http://{v1}.object.localhost/p"))
        );
    }

    #[tokio::test]
    async fn test_should_not_redirect_canonical_roots_again() {
        let backend = MemoryBackend::new();
        let long = identity_cid(RAW, &[7u8; 35]).unwrap();
        let label = object_dns_label(&long).unwrap();
        assert!(label.starts_with('k'));
        let host = format!("{label}.object.localhost");
        let routed = serve(
            router(&[])
                .route(&backend, &request(&host, "/"))
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, format!("/object/{label}/"));
    }

    #[tokio::test]
    async fn test_should_reject_subdomains_on_path_only_gateways() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"x");
        let host = format!("{cid}.object.example.org");
        let route = router(&[("example.org", Some(GatewaySpec::path()))])
            .route(&backend, &request(&host, "/"))
            .await
            .unwrap();
        assert_eq!(route, Route::NotFound);
    }

    #[tokio::test]
    async fn test_should_recover_inlined_dnslink_names() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"site");
        backend.set_dnslink("my.v-long.example.com", ContentPath::from_cid(&cid));
        let routed = serve(
            router(&[])
                .route(
                    &backend,
                    &request("my-v--long-example-com.name.localhost", "/index.html"),
                )
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, "/name/my.v-long.example.com/index.html");
    }

    #[tokio::test]
    async fn test_should_inline_dnslink_names_over_https() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"site");
        backend.set_dnslink("en.example.org", ContentPath::from_cid(&cid));
        let req = RouteRequest {
            https: true,
            ..request("localhost", "/name/en.example.org/wiki")
        };
        let routed = serve(router(&[]).route(&backend, &req).await.unwrap());
        assert_eq!(
            routed.pending_redirect.as_deref(),
            Some("https://en-example-org.name.localhost/wiki")
        );
    }

    #[tokio::test]
    async fn test_should_serve_dnslink_hosts() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"site");
        backend.set_dnslink("docs.example.net", ContentPath::from_cid(&cid));
        let routed = serve(
            router(&[])
                .route(&backend, &request("docs.example.net:8080", "/guide"))
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, "/name/docs.example.net/guide");
        assert_eq!(routed.dnslink_hostname.as_deref(), Some("docs.example.net:8080"));
        assert!(routed.is_origin_isolated());
    }

    #[tokio::test]
    async fn test_should_skip_dnslink_when_disabled() {
        let backend = MemoryBackend::new();
        let cid = sha256_cid(RAW, b"site");
        backend.set_dnslink("docs.example.net", ContentPath::from_cid(&cid));
        let router = HostnameRouter::new(HostnameGateways::new(&HashMap::new()).unwrap(), true);
        let routed = serve(
            router
                .route(&backend, &request("docs.example.net", "/guide"))
                .await
                .unwrap(),
        );
        assert_eq!(routed.path, "/guide");
    }
}
