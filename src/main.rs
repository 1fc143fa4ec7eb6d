//! LLM Relay Server - Main entry point
//!
//! Loads the YAML configuration, builds one backend client per credential and
//! serves every client protocol from a single router.

use anyhow::Result;
use llm_relay_rust::{
    api::{router, AppState},
    core::{init_metrics, logging::init_tracing, AppConfig},
    services::{BackendClient, ClientPool, HttpBackendClient, ModelRegistry},
    transformer::TranslatorRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    tracing::info!("Loading configuration from {}", config_path);
    let config = AppConfig::load(&config_path)?;
    tracing::info!(
        "Configuration loaded: {} credentials, {} API keys",
        config.credentials.len(),
        config.api_keys.len()
    );

    let http_client = create_http_client()?;
    let clients: Vec<Arc<dyn BackendClient>> = config
        .credentials
        .iter()
        .map(|credential| {
            Arc::new(HttpBackendClient::from_config(
                credential,
                http_client.clone(),
                config.request_timeout(),
            )) as Arc<dyn BackendClient>
        })
        .collect();

    let registry = Arc::new(ModelRegistry::with_ttl(config.quota_cooldown()));
    let pool = Arc::new(ClientPool::new(clients, registry.clone()));
    let translators = Arc::new(TranslatorRegistry::with_defaults());
    tracing::info!("Registered {} protocol translations", translators.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = registry.clone().spawn_cleanup_task(
        Duration::from_secs(config.quota_cleanup_interval_secs.max(1)),
        shutdown_rx,
    );

    let state = Arc::new(AppState::new(&config, pool, translators));
    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Starting LLM Relay on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/responses, /v1/models");
    tracing::info!("Claude API: /v1/messages");
    tracing::info!("Gemini API: /v1beta/models/{{model}}:generateContent, /v1internal:generateContent");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    cleanup.await.ok();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create HTTP client with connection pooling
///
/// No overall timeout here: streams can legitimately run for minutes, so each
/// backend client applies the request timeout to non-streaming calls itself.
fn create_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()?)
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if let [quota, period] = parts.as_slice() {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                if quota > 0 && period > 0 {
                    return Some(((quota as f64 / period as f64).ceil() as usize).max(1));
                }
            }
        }
    }

    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    (quota > 0 && period > 0).then(|| ((quota as f64 / period as f64).ceil() as usize).max(1))
}
