//! chunkcache daemon
//!
//! Opens the tiered chunk cache, keeps the disk tier within budget, and
//! exposes health and Prometheus metrics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       chunkcache                           │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐    │
//! │  │ TieredCache  │◀──│  Reclaimer   │   │ HTTP server  │    │
//! │  │ memory+disk  │   │ (interval)   │   │ /metrics     │    │
//! │  └──────────────┘   └──────────────┘   │ /healthz     │    │
//! │         ▲                              │ /stats       │    │
//! │         └──────────────────────────────┴──────────────┘    │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunkcache::cache::{PrometheusExporter, TieredCache};
use chunkcache::config::{parse_duration, CacheConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// chunkcache - tiered chunk cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override its values
    #[arg(long, env = "CHUNKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of the disk tier
    #[arg(long, env = "CHUNKCACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Maximum number of chunks held in memory
    #[arg(long, env = "CHUNKCACHE_MEMORY_CAPACITY")]
    memory_capacity: Option<usize>,

    /// Disk tier budget in bytes
    #[arg(long, env = "CHUNKCACHE_MAX_DISK_BYTES")]
    max_disk_bytes: Option<u64>,

    /// Reclamation interval (e.g. "60s", "5m")
    #[arg(long, env = "CHUNKCACHE_RECLAIM_INTERVAL")]
    reclaim_interval: Option<String>,

    /// Interval between cache statistics log lines
    #[arg(long, env = "CHUNKCACHE_STATS_INTERVAL", default_value = "5m")]
    stats_interval: String,

    /// HTTP server bind address (metrics, health, stats)
    #[arg(long, env = "CHUNKCACHE_HTTP_ADDR", default_value = "127.0.0.1:9464")]
    http_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Layer command-line overrides over the optional config file
    fn cache_config(&self) -> anyhow::Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_yaml_file(path)
                .with_context(|| format!("loading config file {}", path.display()))?,
            None => CacheConfig::default(),
        };

        if let Some(root) = &self.cache_root {
            config.cache_root = root.clone();
        }
        if let Some(capacity) = self.memory_capacity {
            config.memory_capacity = capacity;
        }
        if let Some(max) = self.max_disk_bytes {
            config.max_disk_bytes = max;
        }
        if let Some(interval) = &self.reclaim_interval {
            config.reclaim_interval = parse_duration(interval)?;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = args.cache_config()?;
    let stats_interval = parse_duration(&args.stats_interval)?;

    info!("Starting chunkcache");
    info!("  Cache root: {}", config.cache_root.display());
    info!("  Memory capacity: {} chunks", config.memory_capacity);
    info!("  Disk budget: {} bytes", config.max_disk_bytes);
    info!(
        "  Watermarks: high {:.0}%, low {:.0}%",
        config.high_watermark * 100.0,
        config.low_watermark * 100.0
    );
    info!("  Reclaim interval: {:?}", config.reclaim_interval);

    let cache = Arc::new(TieredCache::open(config).context("opening chunk cache")?);
    let shutdown = CancellationToken::new();

    // Reclaimer
    let reclaimer_handle = match cache.reclaimer() {
        Some(reclaimer) => {
            let reclaimer = Arc::new(reclaimer?);
            Some(tokio::spawn(reclaimer.run(shutdown.clone())))
        }
        None => {
            warn!("No disk tier, reclaimer not started");
            None
        }
    };

    // Periodic statistics
    let stats_handle = tokio::spawn(log_stats(cache.clone(), stats_interval, shutdown.clone()));

    // HTTP server
    let registry = Registry::new();
    let exporter = PrometheusExporter::register(&registry)?;
    let state = Arc::new(HttpState {
        cache: cache.clone(),
        registry,
        exporter,
    });
    let http_addr = args.http_addr.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = run_http_server(&http_addr, state).await {
            error!("HTTP server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    http_handle.abort();
    if let Some(handle) = reclaimer_handle {
        if let Err(e) = handle.await {
            error!("Reclaimer task failed: {}", e);
        }
    }
    if let Err(e) = stats_handle.await {
        error!("Stats task failed: {}", e);
    }

    // Let queued disk writes land before exiting
    let flushing = cache.clone();
    tokio::task::spawn_blocking(move || flushing.flush())
        .await
        .context("flushing pending disk writes")?;

    let snapshot = cache.metrics();
    info!(
        hit_ratio = snapshot.hit_ratio(),
        disk_bytes = snapshot.disk_bytes,
        "chunkcache shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Statistics
// =============================================================================

async fn log_stats(cache: Arc<TieredCache>, every: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    // First tick completes immediately; nothing to report yet
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let s = cache.metrics();
                info!(
                    memory_hits = s.memory_hits,
                    disk_hits = s.disk_hits,
                    misses = s.misses,
                    hit_ratio = s.hit_ratio(),
                    memory_entries = s.memory_entries,
                    disk_entries = s.disk_entries,
                    disk_bytes = s.disk_bytes,
                    writes_dropped = s.disk_writes_dropped,
                    "Cache statistics"
                );
            }
        }
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

struct HttpState {
    cache: Arc<TieredCache>,
    registry: Registry,
    exporter: PrometheusExporter,
}

async fn run_http_server(addr: &str, state: Arc<HttpState>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use tokio::net::TcpListener;

    fn respond(
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    async fn handler(
        req: Request<hyper::body::Incoming>,
        state: Arc<HttpState>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "text/plain", "ok"),
            "/metrics" => {
                state.exporter.observe(&state.cache.metrics());
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&state.registry.gather(), &mut buffer) {
                    Ok(()) => respond(StatusCode::OK, "text/plain; version=0.0.4", buffer),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            "/stats" => match serde_json::to_vec(&state.cache.metrics()) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid HTTP server address {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding HTTP server to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("HTTP server accept")?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handler(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }
}
