//! objgate daemon
//!
//! Runs the background side of the gateway in standalone mode: clusters
//! built from configuration, in-memory metadata, bus and locks, the recycle
//! queue, the lifecycle scanner with one worker per bus partition and the
//! restore orchestrator.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           objgate                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌──────────────┐   ┌───────────┐   ┌─────────┐  │
//! │  │ Lifecycle │──▶│ Partitioned  │──▶│ Lifecycle │──▶│  Data   │  │
//! │  │  Scanner  │   │     Bus      │   │  Workers  │   │  Path   │  │
//! │  └───────────┘   └──────────────┘   └───────────┘   └─────────┘  │
//! │  ┌───────────┐   ┌──────────────┐   ┌───────────┐                │
//! │  │  Restore  │──▶│ Lock Keeper  │   │  Recycle  │                │
//! │  │  Orch.    │   │ (refresher)  │   │   Queue   │                │
//! │  └───────────┘   └──────────────┘   └───────────┘                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use objgate::adapters::{BackendRegistry, InMemoryLockService, MemoryKvStore, PartitionedBus, StripedClusterConfig};
use objgate::config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use objgate::domain::MessageBus;
use objgate::error::{Error, Result};
use objgate::lifecycle::{LifecycleScanner, LifecycleWorker, ScannerConfig};
use objgate::meta::MetaStore;
use objgate::metrics;
use objgate::restore::{LockKeeper, LockKeeperConfig, OrchestratorConfig, RestoreOrchestrator};
use objgate::storage::{ClusterSelector, ClusterWeight, DataPath, RecycleQueue, RecycleQueueConfig, SelectorConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// objgate - S3 object gateway background services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; must exist when given
    #[arg(long, short, env = "OBJGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Do not run the lifecycle scanner and workers
    #[arg(long, env = "DISABLE_LIFECYCLE")]
    disable_lifecycle: bool,

    /// Do not run the restore orchestrator
    #[arg(long, env = "DISABLE_RESTORE")]
    disable_restore: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = GatewayConfig::load(&config_path, args.config.is_some())?;

    init_logging(&args, &config);
    metrics::init()?;

    info!("Starting objgate");
    info!("  Config: {}", config_path.display());
    info!("  Clusters: {}", config.clusters.len());
    info!("  Lifecycle partitions: {}", config.lifecycle.partitions);
    info!("  Restore cron: {}", config.restore.enable_cron);

    let shutdown = CancellationToken::new();
    let fatal = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // Backends
    let registry = BackendRegistry::new();
    let clusters = registry
        .build_all(&config.clusters, &StripedClusterConfig::from_gateway(&config)?)
        .await?;
    let selector = Arc::new(ClusterSelector::new(
        SelectorConfig::from_gateway(&config)?,
        clusters.clone(),
        ClusterWeight::from_gateway(&config),
    ));

    // Metadata and garbage collection
    let meta = MetaStore::new(Arc::new(MemoryKvStore::new()));
    let recycle = RecycleQueue::new(RecycleQueueConfig::from_gateway(&config)?, clusters, meta.clone());
    let reloaded = recycle.load_persisted().await?;
    if reloaded > 0 {
        info!("Reloaded {} blobs awaiting removal", reloaded);
    }
    let recycle_handle = tokio::spawn(Arc::clone(&recycle).run(shutdown.clone()));

    let data = Arc::new(
        DataPath::new(selector, meta.clone(), recycle).with_timeouts(config.timeouts.resolve()?),
    );

    // Lifecycle
    let mut tasks = Vec::new();
    if !args.disable_lifecycle {
        let bus = Arc::new(PartitionedBus::new(config.lifecycle.partitions));
        let worker = Arc::new(LifecycleWorker::new(Arc::clone(&data)));
        for partition in 0..bus.partitions() {
            let Some(rx) = bus.take_receiver(partition) else {
                continue;
            };
            tasks.push(tokio::spawn(Arc::clone(&worker).run(
                partition,
                rx,
                shutdown.clone(),
            )));
        }
        let scanner = Arc::new(LifecycleScanner::new(
            ScannerConfig::from_gateway(&config)?,
            meta.clone(),
            bus as Arc<dyn MessageBus>,
        ));
        tasks.push(tokio::spawn(scanner.run(shutdown.clone())));
        info!("Lifecycle components initialized");
    }

    // Restore
    let locks = Arc::new(LockKeeper::new(
        Arc::new(InMemoryLockService::new()),
        LockKeeperConfig::from_gateway(&config),
        fatal.clone(),
    ));
    if !args.disable_restore {
        tasks.push(tokio::spawn(Arc::clone(&locks).run_refresher(shutdown.clone())));
        let orchestrator = Arc::new(RestoreOrchestrator::new(
            OrchestratorConfig::from_gateway(&config)?,
            Arc::clone(&data),
            Arc::clone(&locks),
        ));
        tasks.push(tokio::spawn(orchestrator.run(shutdown.clone())));
        info!("Restore components initialized");
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    ready.store(true, Ordering::SeqCst);
    info!("objgate running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
        }
        _ = fatal.cancelled() => {
            warn!("Lock service failed, shutting down");
        }
    }

    ready.store(false, Ordering::SeqCst);
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {}", e);
        }
    }
    locks.release_all().await;
    if let Err(e) = recycle_handle.await {
        error!("Recycle queue panicked: {}", e);
    }

    info!("objgate shutdown complete");
    if fatal.is_cancelled() {
        return Err(Error::LockService("lock service failure".to_string()));
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args, config: &GatewayConfig) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone())
        .to_lowercase();
    let level = match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", level)));

    if args.log_json || config.log.json {
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
}

// =============================================================================
// HTTP Helpers
// =============================================================================

type Body = http_body_util::Full<hyper::body::Bytes>;

fn respond(status: hyper::StatusCode, body: impl Into<hyper::body::Bytes>) -> hyper::Response<Body> {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn bind(addr: &str, what: &str) -> Result<tokio::net::TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} address: {}", what, e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("{} listening on {}", what, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Health server").await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{header, Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<hyper::Response<Body>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&prometheus::gather(), &mut buffer) {
                    Ok(()) => {
                        let mut response = respond(StatusCode::OK, buffer);
                        if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                            response.headers_mut().insert(header::CONTENT_TYPE, value);
                        }
                        response
                    }
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let listener = bind(addr, "Metrics server").await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
