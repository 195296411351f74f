//! Segment metadata daemon.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`SEGMETA_*`), and CLI flags. Registers the segment lists found in the data directory, keeps
//! metadata residency balanced in the background, serves health/readiness/metrics endpoints, and
//! runs until graceful shutdown (SIGINT/SIGTERM).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use segmeta::telemetry::{MetaEvent, MetaEventListener};
use segmeta::{MetaConfig, MetaService, MetadataRegistry, MetricsSegmentRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "prometheus")]
use segmeta::telemetry::meta_metrics::InProcessPrometheus;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:9090";
const DEFAULT_CONFIG_FILE: &str = "segmetad.toml";

// ---------- CLI ----------

/// Segment metadata registry and cache daemon.
#[derive(Parser, Debug)]
#[command(name = "segmetad", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `segmetad.toml` is loaded when it exists.
    #[arg(long, env = "SEGMETA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (segment files and segment-list snapshots).
    #[arg(long, env = "SEGMETA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print effective values, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address for health/readiness/metrics endpoints.
    #[arg(long, env = "SEGMETA_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Worker threads for metadata loads and pruning.
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Bytes available to metadata on each rebalance round.
    #[arg(long)]
    pub total_memory_bytes: Option<u64>,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub http_bind: Option<String>,
    pub data_dir: Option<String>,
    pub parallelism: Option<usize>,
    pub total_memory_bytes: Option<u64>,
    pub micro_index_mem_percent: Option<u8>,
    pub search_metadata_mem_percent: Option<u8>,
    pub metadata_logs_mem_percent: Option<u8>,
    pub metadata_metrics_mem_percent: Option<u8>,
    pub timestamp_key: Option<String>,
    pub reserved_columns: Option<Vec<String>>,
    pub dual_case_search: Option<bool>,
    pub rebalance_interval_secs: Option<u64>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub http_bind: SocketAddr,
}

fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(MetaConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(true));
        } else {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("SEGMETA")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut meta_config = MetaConfig::default();
    merge_into_meta_config(&mut meta_config, &partial);

    if let Some(ref d) = cli.data_dir {
        meta_config.data_dir = d.clone();
    }
    if let Some(n) = cli.parallelism {
        meta_config.parallelism = n;
    }
    if let Some(b) = cli.total_memory_bytes {
        meta_config.total_memory_bytes = b;
    }
    meta_config.validate().map_err(|e| e.to_string())?;

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or(DEFAULT_HTTP_BIND);
    let http_bind = parse_http_bind(http_bind_str)?;

    Ok((meta_config, DaemonOptions { http_bind }))
}

/// Merge file/env partial config onto `MetaConfig`. Only overwrites fields that are `Some`.
fn merge_into_meta_config(base: &mut MetaConfig, partial: &DaemonFileConfig) {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(n) = partial.parallelism {
        base.parallelism = n;
    }
    if let Some(b) = partial.total_memory_bytes {
        base.total_memory_bytes = b;
    }
    if let Some(p) = partial.micro_index_mem_percent {
        base.micro_index_mem_percent = p;
    }
    if let Some(p) = partial.search_metadata_mem_percent {
        base.search_metadata_mem_percent = p;
    }
    if let Some(p) = partial.metadata_logs_mem_percent {
        base.metadata_logs_mem_percent = p;
    }
    if let Some(p) = partial.metadata_metrics_mem_percent {
        base.metadata_metrics_mem_percent = p;
    }
    if let Some(k) = &partial.timestamp_key {
        base.timestamp_key = k.clone();
    }
    if let Some(cols) = &partial.reserved_columns {
        base.reserved_columns = cols.clone();
    }
    if let Some(b) = partial.dual_case_search {
        base.dual_case_search = b;
    }
    if let Some(secs) = partial.rebalance_interval_secs {
        base.rebalance_interval = Duration::from_secs(secs);
    }
}

// ---------- Logging ----------

/// Forwards library events to `tracing`.
#[derive(Debug)]
struct TracingEventListener;

impl MetaEventListener for TracingEventListener {
    fn on_event(&self, event: MetaEvent) {
        match event {
            MetaEvent::RebalanceThreadStarted => tracing::info!("rebalance thread started"),
            MetaEvent::RebalanceThreadStopping => tracing::info!("rebalance thread stopping"),
            MetaEvent::RebalanceThreadPanicked => tracing::error!("rebalance thread panicked"),
            MetaEvent::SegmentLoadFailed { segment, tier, error } => {
                tracing::warn!(%segment, %tier, %error, "segment load failed")
            }
            MetaEvent::MicroIndexFileSkipped { segment, column, error } => {
                tracing::warn!(%segment, %column, %error, "micro-index file skipped")
            }
            MetaEvent::PersistentColumnsFailed { table, error } => {
                tracing::warn!(%table, %error, "persistent column lookup failed")
            }
            MetaEvent::MergeConflict { segment, error } => {
                tracing::warn!(%segment, %error, "segment merge conflict")
            }
            MetaEvent::StaleDelete { segment } => tracing::debug!(%segment, "delete for unknown segment"),
            MetaEvent::UnknownSegment { segment, table } => {
                tracing::warn!(%segment, %table, "prune request for unknown segment")
            }
            MetaEvent::RebalanceCompleted {
                tier,
                budget_bytes,
                resident_bytes,
                resident_count,
                evicted,
                loaded,
                duration,
            } => tracing::info!(
                %tier,
                budget_bytes,
                resident_bytes,
                resident_count,
                evicted,
                loaded,
                duration_ms = duration.as_millis() as u64,
                "rebalance completed"
            ),
            MetaEvent::SegmetaLineSkipped { path, line, error } => {
                tracing::warn!(path = %path.display(), line, %error, "segment list line skipped")
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segmeta=info,segmetad=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let probe = data_dir.join(".segmeta_write_probe");
    std::fs::write(&probe, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(probe);
    Ok(())
}

// ---------- HTTP server ----------

struct HttpState {
    ready: Arc<AtomicBool>,
    registry: Arc<MetadataRegistry>,
    metrics_registry: Arc<MetricsSegmentRegistry>,
    #[cfg(feature = "prometheus")]
    prometheus: Option<Arc<InProcessPrometheus>>,
}

impl HttpState {
    fn render_metrics(&self) -> (StatusCode, Bytes) {
        #[cfg(feature = "prometheus")]
        {
            if let Some(p) = &self.prometheus {
                return (StatusCode::OK, Bytes::from(p.render()));
            }
        }
        (StatusCode::NOT_FOUND, Bytes::from("metrics exporter disabled"))
    }
}

async fn http_service(
    state: Arc<HttpState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/healthz") => (StatusCode::OK, Bytes::from("ok")),
        (&hyper::Method::GET, "/readyz") => {
            // Ready once the segment lists are registered and the first round has run.
            if state.ready.load(Ordering::Acquire) {
                (StatusCode::OK, Bytes::from("ok"))
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, Bytes::from("not ready"))
            }
        }
        (&hyper::Method::GET, "/metrics") => state.render_metrics(),
        (&hyper::Method::GET, "/status") => {
            let status = serde_json::json!({
                "segments": state.registry.segment_count(),
                "tables": state.registry.table_count(),
                "metrics_segments": state.metrics_registry.segment_count(),
            });
            (StatusCode::OK, Bytes::from(status.to_string()))
        }
        _ => (StatusCode::NOT_FOUND, Bytes::from("not found")),
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    Ok(response)
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Serves HTTP until a shutdown signal, then drains connections and stops the service.
async fn run_with_http_server(
    service: MetaService,
    options: DaemonOptions,
    state: Arc<HttpState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(options.http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", options.http_bind, e))?;
    tracing::info!(
        data_dir = %service.config().data_dir.display(),
        http = %options.http_bind,
        "segmetad running"
    );

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { http_service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::debug!(error = ?e, "http connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    state.ready.store(false, Ordering::Release);
    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => tracing::info!("all http connections closed"),
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => tracing::warn!("shutdown timeout waiting for connections"),
    }

    // Dropping the service joins the rebalance thread, which may be mid-round.
    tokio::task::spawn_blocking(move || drop(service)).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (mut meta_config, options) = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("data_dir={}", meta_config.data_dir.display());
        println!("parallelism={}", meta_config.parallelism);
        println!("total_memory_bytes={}", meta_config.total_memory_bytes);
        println!("micro_index_mem_percent={}", meta_config.micro_index_mem_percent);
        println!("search_metadata_mem_percent={}", meta_config.search_metadata_mem_percent);
        println!("rebalance_interval_secs={}", meta_config.rebalance_interval.as_secs());
        println!("http_bind={}", options.http_bind);
        return Ok(());
    }

    init_tracing();

    check_data_dir_writable(&meta_config.data_dir).map_err(|e| {
        tracing::error!(error = %e, "startup check failed");
        e
    })?;

    #[cfg(feature = "prometheus")]
    let prometheus = match InProcessPrometheus::install(Duration::from_secs(5)) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder not installed");
            None
        }
    };

    meta_config.event_listener = Arc::new(TracingEventListener);
    let total_memory_bytes = meta_config.total_memory_bytes;
    let mut service = MetaService::with_config(meta_config)?;
    let (segments, metrics_segments) = service.load_snapshots()?;
    tracing::info!(segments, metrics_segments, "segment lists registered");

    let summary = service.rebalance_now(total_memory_bytes);
    tracing::info!(
        micro_index_resident = summary.micro_index.resident_count,
        search_metadata_resident = summary.search_metadata.resident_count,
        "initial rebalance done"
    );
    service.start_background_rebalance()?;

    let state = Arc::new(HttpState {
        ready: Arc::new(AtomicBool::new(true)),
        registry: Arc::clone(service.registry()),
        metrics_registry: Arc::clone(service.metrics_registry()),
        #[cfg(feature = "prometheus")]
        prometheus,
    });
    run_with_http_server(service, options, state).await
}
