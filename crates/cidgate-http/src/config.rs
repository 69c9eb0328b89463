//! Gateway HTTP configuration.
//!
//! Provides [`GatewayConfig`] for the HTTP layer and [`GatewaySpec`], the
//! per-hostname behaviour of a public gateway.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use cidgate_core::Namespace;

fn default_paths() -> Vec<String> {
    Namespace::ALL
        .iter()
        .map(|ns| ns.prefix().to_owned())
        .collect()
}

/// How one gateway hostname behaves.
///
/// # Examples
///
/// ```
/// use cidgate_http::config::GatewaySpec;
///
/// let spec = GatewaySpec::builder().use_subdomains(true).build();
/// assert_eq!(spec.paths, vec!["/object", "/name"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Path prefixes served on this hostname (e.g. `/object`).
    #[builder(default = default_paths())]
    #[serde(default = "default_paths")]
    pub paths: Vec<String>,

    /// Serve content from `{root}.{namespace}.{hostname}` origins.
    #[builder(default = false)]
    #[serde(default)]
    pub use_subdomains: bool,

    /// Do not serve the hostname's own DNS link record.
    #[builder(default = false)]
    #[serde(default)]
    pub no_dnslink: bool,

    /// Fold DNS link names into a single label even over plain HTTP.
    #[builder(default = false)]
    #[serde(default)]
    pub inline_dnslink: bool,
}

impl GatewaySpec {
    /// A subdomain gateway serving both namespaces.
    #[must_use]
    pub fn subdomain() -> Self {
        Self::builder().use_subdomains(true).build()
    }

    /// A path gateway serving both namespaces.
    #[must_use]
    pub fn path() -> Self {
        Self::builder().build()
    }
}

/// Gateway HTTP configuration.
///
/// # Examples
///
/// ```
/// use cidgate_http::config::GatewayConfig;
///
/// let config = GatewayConfig::default();
/// assert!(!config.no_dnslink);
/// assert_eq!(config.max_redirects_file_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Hostname table. A `None` entry removes a built-in default.
    #[builder(default)]
    #[serde(default)]
    pub public_gateways: HashMap<String, Option<GatewaySpec>>,

    /// Never serve DNS link records for unknown hostnames.
    #[builder(default = false)]
    #[serde(default)]
    pub no_dnslink: bool,

    /// Extra headers set on every response.
    #[builder(default)]
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Ceiling on producing a response head.
    #[builder(default = Duration::from_secs(3600))]
    pub request_timeout: Duration,

    /// Largest `_redirects` file that is parsed.
    #[builder(default = 64 * 1024)]
    pub max_redirects_file_size: u64,

    /// Serve Prometheus metrics on `/metrics`.
    #[builder(default = true)]
    pub metrics_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Hostnames served without any configuration.
#[must_use]
pub fn default_gateways() -> HashMap<String, GatewaySpec> {
    let mut gateways = HashMap::new();
    gateways.insert("localhost".to_owned(), GatewaySpec::subdomain());
    gateways.insert("127.0.0.1".to_owned(), GatewaySpec::path());
    gateways.insert("::1".to_owned(), GatewaySpec::path());
    gateways
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_default_to_generous_timeouts() {
        let config = GatewayConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(3600));
        assert!(config.metrics_enabled);
        assert!(config.public_gateways.is_empty());
    }

    #[test]
    fn test_should_deserialize_gateway_table_with_removals() {
        let json = r#"{
            "example.com": {"useSubdomains": true, "paths": ["/object"]},
            "localhost": null
        }"#;
        let table: HashMap<String, Option<GatewaySpec>> = serde_json::from_str(json).unwrap();
        let spec = table["example.com"].as_ref().unwrap();
        assert!(spec.use_subdomains);
        assert_eq!(spec.paths, vec!["/object"]);
        assert!(table["localhost"].is_none());
    }

    #[test]
    fn test_should_fill_paths_when_omitted() {
        let spec: GatewaySpec = serde_json::from_str(r#"{"noDnslink": true}"#).unwrap();
        assert!(spec.no_dnslink);
        assert_eq!(spec.paths, default_paths());
    }

    #[test]
    fn test_should_include_localhost_subdomain_gateway_by_default() {
        let gateways = default_gateways();
        assert!(gateways["localhost"].use_subdomains);
        assert!(!gateways["127.0.0.1"].use_subdomains);
    }
}
