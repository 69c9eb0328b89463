//! Hostname routing, format negotiation, renderers, and hyper service for the
//! cidgate content gateway.
//!
//! This crate provides the HTTP layer in front of a
//! [`GatewayBackend`](cidgate_core::GatewayBackend). It handles:
//!
//! - **Hostname routing** ([`hostname`]): path gateways, subdomain gateways
//!   with canonical DNS labels, and DNS link hosts.
//!
//! - **Negotiation** ([`negotiate`]): picks a representation from the
//!   `format` query parameter or the `Accept` header.
//!
//! - **Renderers** ([`handlers`]): UnixFS files and directories, raw blocks,
//!   CAR and TAR archives, structured data, and naming records.
//!
//! - **Redirects** ([`redirects`]): `_redirects` rules for origin-isolated
//!   sites and the legacy `object-404.html` convention.
//!
//! - **Caching** ([`caching`]): ETags, conditional requests, byte ranges, and
//!   `Content-Disposition`.
//!
//! - **Service** ([`service`]): [`GatewayService`], the hyper `Service` tying
//!   the above together.
//!
//! # Architecture
//!
//! ```text
//! HTTP Request
//!   -> GatewayService (hyper Service)
//!     -> Health / metrics / CORS interception
//!     -> HostnameRouter (gateway table, subdomains, DNS link)
//!     -> Path checks, only-if-cached
//!     -> negotiate (format query / Accept)
//!     -> handlers::serve (one renderer per format)
//!     -> Common response headers (X-Request-Id, X-Object-Path, CORS)
//!   <- HTTP Response
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cidgate_core::MemoryBackend;
//! use cidgate_http::{GatewayConfig, GatewayService};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let service = GatewayService::new(backend, GatewayConfig::default()).unwrap();
//! // Use `service` with hyper server.
//! ```

pub mod body;
pub mod caching;
pub mod config;
pub mod handlers;
pub mod hostname;
pub mod html;
pub mod metrics;
pub mod negotiate;
pub mod redirects;
pub mod response;
pub mod service;

// Re-export key types for convenience.
pub use body::GatewayBody;
pub use config::{GatewayConfig, GatewaySpec};
pub use hostname::{HostnameGateways, HostnameRouter, Route, Routed};
pub use negotiate::ResponseFormat;
pub use service::GatewayService;
