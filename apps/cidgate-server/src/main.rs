//! cidgate server - content-addressed HTTP gateway.
//!
//! This binary serves `/object/...` and `/name/...` content from an in-memory
//! store through `cidgate-http`, optionally seeded from a directory at
//! startup, and exposes health and metrics endpoints for orchestration
//! systems.
//!
//! # Usage
//!
//! ```text
//! GATEWAY_LISTEN=0.0.0.0:8080 GATEWAY_SEED_DIR=./site cidgate-server
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_LISTEN` | `0.0.0.0:8080` | Bind address |
//! | `GATEWAY_PUBLIC_GATEWAYS` | *(unset)* | JSON object of hostname to gateway spec |
//! | `GATEWAY_NO_DNSLINK` | `false` | Never serve DNS link records for unknown hosts |
//! | `GATEWAY_DNSLINK` | *(unset)* | Static DNS link records, `host=/object/<cid>,...` |
//! | `GATEWAY_SEED_DIR` | *(unset)* | Files, directories, and `.car` archives to load |
//! | `GATEWAY_REQUEST_TIMEOUT_SECS` | `3600` | Ceiling on producing a response head |
//! | `GATEWAY_CAR_TIMEOUT_SECS` | `300` | Ceiling on a single CAR export |
//! | `LOG_LEVEL` | `info` | Log level filter |
//! | `RUST_LOG` | *(unset)* | Fine-grained tracing filter (overrides `LOG_LEVEL`) |

mod config;
mod seed;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cidgate_core::MemoryBackend;
use cidgate_http::GatewayService;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Server version reported at startup.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config value.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Build the in-memory backend and load startup content into it.
fn build_backend(config: &ServerConfig) -> Result<MemoryBackend> {
    let backend = MemoryBackend::new().with_car_timeout(config.car_timeout);

    if let Some(dir) = &config.seed_dir {
        let seeded = seed::seed_dir(&backend, dir)
            .with_context(|| format!("failed to seed from {}", dir.display()))?;
        for (name, cid) in &seeded {
            info!(%name, %cid, "seeded content");
        }
        if seeded.is_empty() {
            warn!(dir = %dir.display(), "seed directory is empty");
        }
    }

    seed::apply_dnslink(&backend, &config.dnslink)?;
    for (host, target) in &config.dnslink {
        info!(%host, %target, "registered DNS link record");
    }

    Ok(backend)
}

/// Run the accept loop, serving connections until a shutdown signal is received.
async fn serve(listener: TcpListener, service: GatewayService) -> Result<()> {
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal, draining connections");
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let svc = service.clone();
                let conn = http.serve_connection(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(peer_addr = %peer_addr, error = %e, "connection error");
                    }
                });
            }

            () = &mut shutdown => {
                info!("shutting down gracefully");
                break;
            }
        }
    }

    // Wait for in-flight requests to complete.
    graceful.shutdown().await;
    info!("all connections drained, exiting");

    Ok(())
}

/// Perform a health check by connecting to the gateway and requesting the health endpoint.
///
/// Exits with code 0 if healthy, 1 otherwise.
async fn run_health_check(addr: &str) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;

    let (mut reader, mut writer) = stream.into_split();

    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.shutdown().await?;

    let mut response = String::new();
    reader.read_to_string(&mut response).await?;

    if response.contains("200 OK") && response.contains("\"status\":\"running\"") {
        Ok(())
    } else {
        anyhow::bail!("unhealthy response from {addr}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --health-check flag for Docker HEALTHCHECK.
    if std::env::args().any(|a| a == "--health-check") {
        let healthy = match ServerConfig::from_env() {
            Ok(config) => {
                let addr = config.gateway_listen.replace("0.0.0.0", "127.0.0.1");
                run_health_check(&addr).await.is_ok()
            }
            Err(_) => false,
        };
        std::process::exit(i32::from(!healthy));
    }

    let config = ServerConfig::from_env()?;

    init_tracing(&config.log_level)?;

    info!(
        gateway_listen = %config.gateway_listen,
        public_gateways = config.public_gateways.len(),
        no_dnslink = config.no_dnslink,
        request_timeout_secs = config.request_timeout.as_secs(),
        car_timeout_secs = config.car_timeout.as_secs(),
        version = VERSION,
        "starting cidgate server",
    );

    let backend = build_backend(&config)?;
    let service = GatewayService::new(Arc::new(backend), config.gateway_config())
        .context("invalid public gateway hostname")?;

    let addr: SocketAddr = config
        .gateway_listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.gateway_listen))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(%addr, "listening for connections");

    serve(listener, service).await
}
