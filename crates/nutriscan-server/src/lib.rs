//! Nutriscan control plane
//!
//! HTTP ingestion API for nutrition-document parsing, built with axum.
//! The server binary embeds the capstan dispatcher and lease sweeper the
//! way a control-plane process embeds its execution engine, so a single
//! process serves requests and works the queue; extra worker processes
//! can share the same store.

use capstan::store::JobStore;
use capstan::{
    BlobStore, CallbackConfig, CallbackSender, Dispatcher, DispatcherConfig, QueueConfig,
    SqliteStore, Sweeper,
};
use nutriscan_parse::{ParserConfig, Pipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use limiter::RateGate;
use metrics::Metrics;
use tower_http::trace::TraceLayer;

/// Server configuration, loaded from `NUTRISCAN_*` environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub blob_root: String,
    pub max_file_size: u64,
    pub max_sync_file_size: u64,
    pub sync_deadline: Duration,
    pub queue: QueueConfig,
    pub concurrency: usize,
    pub ocr_enabled: bool,
    pub ocr_languages: Vec<String>,
    pub rate_per_minute: u32,
    pub rate_per_hour: u32,
    pub rate_limit_enabled: bool,
    pub retention_days: u32,
    pub callback: CallbackConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: "nutriscan.db".to_string(),
            blob_root: "uploads".to_string(),
            max_file_size: 50 * 1024 * 1024,
            max_sync_file_size: 5 * 1024 * 1024,
            sync_deadline: Duration::from_secs(60),
            queue: QueueConfig::default(),
            concurrency: 2,
            ocr_enabled: false,
            ocr_languages: vec!["eng".to_string()],
            rate_per_minute: 60,
            rate_per_hour: 1000,
            rate_limit_enabled: true,
            retention_days: 30,
            callback: CallbackConfig::default(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "unparseable value, using default");
                default
            }
        },
        None => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_var("NUTRISCAN_HOST").unwrap_or(defaults.host),
            port: env_parse("NUTRISCAN_PORT", defaults.port),
            db_path: env_var("NUTRISCAN_DB").unwrap_or(defaults.db_path),
            blob_root: env_var("NUTRISCAN_BLOB_ROOT").unwrap_or(defaults.blob_root),
            max_file_size: env_parse("NUTRISCAN_MAX_FILE_SIZE", defaults.max_file_size),
            max_sync_file_size: env_parse(
                "NUTRISCAN_MAX_SYNC_FILE_SIZE",
                defaults.max_sync_file_size,
            ),
            sync_deadline: Duration::from_secs(env_parse("NUTRISCAN_SYNC_DEADLINE", 60)),
            queue: QueueConfig {
                lease_duration: Duration::from_secs(env_parse("NUTRISCAN_LEASE_DURATION", 30)),
                sweep_interval: Duration::from_secs(env_parse("NUTRISCAN_SWEEP_INTERVAL", 30)),
                max_attempts: env_parse("NUTRISCAN_MAX_ATTEMPTS", 3),
            },
            concurrency: env_parse("NUTRISCAN_CONCURRENCY", defaults.concurrency),
            ocr_enabled: env_parse("NUTRISCAN_OCR_ENABLED", false),
            ocr_languages: env_var("NUTRISCAN_OCR_LANGUAGES")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.ocr_languages),
            rate_per_minute: env_parse("NUTRISCAN_RATE_PER_MINUTE", defaults.rate_per_minute),
            rate_per_hour: env_parse("NUTRISCAN_RATE_PER_HOUR", defaults.rate_per_hour),
            rate_limit_enabled: env_parse("NUTRISCAN_RATE_LIMIT_ENABLED", true),
            retention_days: env_parse("NUTRISCAN_RETENTION_DAYS", defaults.retention_days),
            callback: CallbackConfig {
                max_attempts: env_parse("NUTRISCAN_CALLBACK_MAX_ATTEMPTS", 5),
                backoff_base: Duration::from_millis(env_parse(
                    "NUTRISCAN_CALLBACK_BACKOFF_MS",
                    1000,
                )),
            },
        }
    }
}

/// Build the full route table over the given state.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_file_size as usize + 1024 * 1024;

    Router::new()
        // Parse endpoints
        .route("/parse/sync", post(api::parse_sync))
        .route("/parse/async", post(api::parse_async))
        .route("/parse/batch", post(api::parse_batch))
        .route("/parse/status/:id", get(api::job_status))
        .route("/parse/result/:id", get(api::job_result))
        .route("/parse/history", get(api::job_history))
        .route("/parse/batch/:id", get(api::batch_status))
        .route("/parse/:id", delete(api::delete_job))
        .route("/parse/:id/cancel", post(api::cancel_job))
        // Admin endpoints
        .route("/admin/metrics", get(api::metrics))
        .route("/admin/stats/real-time", get(api::realtime_stats))
        .route("/admin/cleanup", post(api::cleanup))
        // Health
        .route("/health", get(api::health))
        .route("/health/detailed", get(api::health_detailed))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_id,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire up state, dispatcher, and sweeper, then serve until ctrl-c.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store: Arc<dyn JobStore> = Arc::new(SqliteStore::open(&config.db_path).await?);
    let blobs = Arc::new(BlobStore::new(&config.blob_root));
    blobs.probe().await?;

    let pipeline = Arc::new(Pipeline::new(ParserConfig {
        ocr_enabled: config.ocr_enabled,
        languages: config.ocr_languages.clone(),
        ..Default::default()
    }));

    let callbacks = CallbackSender::new(config.callback.clone());
    let metrics = Arc::new(Metrics::new(callbacks.stats()));
    let gate = Arc::new(RateGate::new(
        config.rate_limit_enabled,
        config.rate_per_minute,
        config.rate_per_hour,
    ));
    let wake = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();

    tracing::info!(
        concurrency = config.concurrency,
        lease_s = config.queue.lease_duration.as_secs(),
        "starting dispatcher"
    );
    let executor = Arc::new(executor::ParseExecutor::new(
        Arc::clone(&blobs),
        Arc::clone(&pipeline),
    ));
    let dispatcher_config = DispatcherConfig {
        concurrency: config.concurrency,
        queue: config.queue.clone(),
        ..Default::default()
    };
    let worker_handles = Dispatcher::new(
        Arc::clone(&store),
        executor,
        dispatcher_config,
        Arc::clone(&wake),
        shutdown.clone(),
    )
    .with_callbacks(callbacks)
    .spawn();

    let sweeper_handle = Sweeper::new(
        Arc::clone(&store),
        config.queue.clone(),
        shutdown.clone(),
    )
    .spawn();

    let state = AppState::new(
        store,
        blobs,
        pipeline,
        gate,
        metrics,
        Arc::clone(&config),
        wake,
    );
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("nutriscan listening on http://{}", addr);

    let shutdown_for_signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_for_signal.cancel();
    })
    .await?;

    // Drain the engine before exit.
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = sweeper_handle.await;
    tracing::info!("nutriscan stopped");

    Ok(())
}
