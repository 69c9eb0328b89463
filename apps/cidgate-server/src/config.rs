//! Server configuration.
//!
//! Provides [`ServerConfig`], loaded from environment variables, and its
//! conversion into the HTTP layer's [`GatewayConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cidgate_http::{GatewayConfig, GatewaySpec};

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address (e.g. `"0.0.0.0:8080"`).
    pub gateway_listen: String,

    /// Log level filter string (e.g. `"info"`, `"debug"`).
    pub log_level: String,

    /// Hostname table overrides; `None` removes a default hostname.
    pub public_gateways: HashMap<String, Option<GatewaySpec>>,

    /// Never serve DNS link records for unknown hostnames.
    pub no_dnslink: bool,

    /// Static DNS link records as `(host, content path)` pairs.
    pub dnslink: Vec<(String, String)>,

    /// Directory whose files and CAR archives are loaded at startup.
    pub seed_dir: Option<PathBuf>,

    /// Ceiling on producing a response head.
    pub request_timeout: Duration,

    /// Ceiling on a single CAR export.
    pub car_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gateway_listen: String::from("0.0.0.0:8080"),
            log_level: String::from("info"),
            public_gateways: HashMap::new(),
            no_dnslink: false,
            dnslink: Vec::new(),
            seed_dir: None,
            request_timeout: Duration::from_secs(3600),
            car_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GATEWAY_LISTEN` | `0.0.0.0:8080` |
    /// | `LOG_LEVEL` | `info` |
    /// | `GATEWAY_PUBLIC_GATEWAYS` | *(none)*, JSON object of hostname to spec or `null` |
    /// | `GATEWAY_NO_DNSLINK` | `false` |
    /// | `GATEWAY_DNSLINK` | *(none)*, comma list of `host=/object/<cid>` |
    /// | `GATEWAY_SEED_DIR` | *(none)* |
    /// | `GATEWAY_REQUEST_TIMEOUT_SECS` | `3600` |
    /// | `GATEWAY_CAR_TIMEOUT_SECS` | `300` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("GATEWAY_LISTEN") {
            config.gateway_listen = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = lookup("GATEWAY_PUBLIC_GATEWAYS").filter(|v| !v.trim().is_empty()) {
            config.public_gateways = serde_json::from_str(&v)
                .context("GATEWAY_PUBLIC_GATEWAYS must be a JSON object of gateway specs")?;
        }
        if let Some(v) = lookup("GATEWAY_NO_DNSLINK") {
            config.no_dnslink = parse_bool(&v);
        }
        if let Some(v) = lookup("GATEWAY_DNSLINK") {
            config.dnslink = parse_dnslink(&v)?;
        }
        if let Some(v) = lookup("GATEWAY_SEED_DIR").filter(|v| !v.is_empty()) {
            config.seed_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GATEWAY_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("GATEWAY_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_CAR_TIMEOUT_SECS") {
            config.car_timeout = parse_secs("GATEWAY_CAR_TIMEOUT_SECS", &v)?;
        }

        Ok(config)
    }

    /// The HTTP layer configuration.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::builder()
            .public_gateways(self.public_gateways.clone())
            .no_dnslink(self.no_dnslink)
            .request_timeout(self.request_timeout)
            .build()
    }
}

/// Parse a string as a boolean, accepting `"1"` and `"true"` (case-insensitive).
fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs = value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{name} must be a whole number of seconds, got {value:?}"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_dnslink(value: &str) -> Result<Vec<(String, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, path) = entry
                .split_once('=')
                .with_context(|| format!("GATEWAY_DNSLINK entry {entry:?} is not host=path"))?;
            Ok((host.trim().to_ascii_lowercase(), path.trim().to_owned()))
        })
        .collect()
}
