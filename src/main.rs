//! QuantCache operator binary
//!
//! Runs the optimization layer as a standalone process: background loops
//! plus an HTTP endpoint for health checks, metrics and status.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      quantcache                            │
//! ├────────────────────────────────────────────────────────────┤
//! │  /healthz /readyz ──▶ HealthCheck                          │
//! │  /metrics         ──▶ MetricsCollector text export         │
//! │  /status          ──▶ LayerStatus (JSON)                   │
//! │  Ctrl-C           ──▶ OptimizationLayer::shutdown          │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quantcache::config::parse_duration;
use quantcache::{OptimizationLayer, OptimizerConfig, WorkloadClass};

// =============================================================================
// CLI Arguments
// =============================================================================

/// QuantCache - adaptive performance layer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML or JSON)
    #[arg(long, env = "QUANTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, env = "QUANTCACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Maximum cache size in bytes
    #[arg(long, env = "QUANTCACHE_MAX_BYTES")]
    max_bytes: Option<u64>,

    /// Default cache TTL (e.g. 1h, 30m)
    #[arg(long, env = "QUANTCACHE_DEFAULT_TTL")]
    default_ttl: Option<String>,

    /// Minimum worker count
    #[arg(long, env = "QUANTCACHE_MIN_WORKERS")]
    min_workers: Option<usize>,

    /// Maximum worker count
    #[arg(long, env = "QUANTCACHE_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Workload class (cpu-bound, io-bound, mixed)
    #[arg(long, env = "QUANTCACHE_WORKLOAD")]
    workload: Option<WorkloadClass>,

    /// Auto-tune interval (e.g. 60s)
    #[arg(long, env = "QUANTCACHE_TUNE_INTERVAL")]
    tune_interval: Option<String>,

    /// Auto-apply confidence threshold
    #[arg(long, env = "QUANTCACHE_CONFIDENCE_THRESHOLD")]
    confidence_threshold: Option<f64>,

    /// Precompute interval (e.g. 5m)
    #[arg(long, env = "QUANTCACHE_PRECOMPUTE_INTERVAL")]
    precompute_interval: Option<String>,

    /// Precompute wall clock budget per cycle (e.g. 2m)
    #[arg(long, env = "QUANTCACHE_PRECOMPUTE_BUDGET")]
    precompute_budget: Option<String>,

    /// Health, metrics and status server bind address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File config (or defaults) with command line overrides applied
    fn to_config(&self) -> anyhow::Result<OptimizerConfig> {
        let mut config = match &self.config {
            Some(path) => OptimizerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => OptimizerConfig::default(),
        };

        if let Some(dir) = &self.cache_dir {
            config.cache.cache_dir = dir.clone();
        }
        if let Some(max_bytes) = self.max_bytes {
            config.cache.max_bytes = max_bytes;
        }
        if let Some(ttl) = &self.default_ttl {
            config.cache.default_ttl = parse_duration(ttl)?;
        }
        if let Some(min) = self.min_workers {
            config.worker_pool.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.worker_pool.max_workers = max;
        }
        if let Some(workload) = self.workload {
            config.worker_pool.workload = workload;
        }
        if let Some(interval) = &self.tune_interval {
            config.auto_tuner.interval = parse_duration(interval)?;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.auto_tuner.confidence_threshold = threshold;
        }
        if let Some(interval) = &self.precompute_interval {
            config.precompute.interval = parse_duration(interval)?;
        }
        if let Some(budget) = &self.precompute_budget {
            config.precompute.cycle_budget = parse_duration(budget)?;
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

    let config = args.to_config()?;
    info!("Starting QuantCache");
    info!("  Cache dir: {}", config.cache.cache_dir.display());
    info!("  Cache max bytes: {}", config.cache.max_bytes);
    info!(
        "  Workers: {}..{} ({})",
        config.worker_pool.min_workers, config.worker_pool.max_workers, config.worker_pool.workload
    );
    info!(
        "  Auto-tune interval: {:?}, threshold {}",
        config.auto_tuner.interval, config.auto_tuner.confidence_threshold
    );

    let layer = OptimizationLayer::new(config).await?;
    quantcache::install_global(layer.clone())?;
    layer.start().await?;

    let addr: SocketAddr = args
        .http_addr
        .parse()
        .with_context(|| format!("invalid HTTP address {}", args.http_addr))?;
    let server_layer = layer.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_http_server(addr, server_layer).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    server.abort();
    layer.shutdown().await?;

    info!("QuantCache shutdown complete");
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
// HTTP Server
// =============================================================================

async fn run_http_server(addr: SocketAddr, layer: Arc<OptimizationLayer>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(
        status: StatusCode,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    fn json(status: StatusCode, value: &impl serde::Serialize) -> Response<Full<Bytes>> {
        match serde_json::to_vec_pretty(value) {
            Ok(body) => respond(status, "application/json", body),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("serialization error: {}", e),
            ),
        }
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        layer: Arc<OptimizationLayer>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => {
                if layer.is_live() {
                    respond(StatusCode::OK, "text/plain", "ok")
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "shutting down")
                }
            }
            "/readyz" => {
                let health = layer.health();
                let status = if layer.is_ready() && health.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json(status, &health)
            }
            "/metrics" => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4",
                layer.monitor().export_text(),
            ),
            "/status" => json(StatusCode::OK, &layer.status()),
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("HTTP accept error")?;
        let io = TokioIo::new(stream);
        let layer = layer.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, layer.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("HTTP connection error: {}", e);
            }
        });
    }
}
