//! Video Generation Task Gateway
//!
//! Single-binary service that:
//! 1. Accepts generation jobs and submits them upstream, rotating through a
//!    pool of credentials when one is throttled
//! 2. Persists every task locally and polls it until it finishes
//! 3. Serves per-scope task lists, reusable templates and extension jobs

mod api;
mod config;
mod error;
mod metrics;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credential_pool::CredentialPool;
use metrics_exporter_prometheus::PrometheusHandle;
use tasks::{FileTaskStore, MemoryTaskStore, Orchestrator, OrchestratorConfig, TaskStore};
use upstream::HttpUpstream;
use upstream_auth::TokenIssuer;

use crate::config::{Config, StoreKind, TasksConfig};
use crate::service::{
    DRAIN_TIMEOUT, ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    metrics: ServiceMetrics,
    /// Scope used when a request names none
    default_scope: Arc<str>,
    prometheus: PrometheusHandle,
    /// Shutdown token for background pollers; `None` disables them
    watchers: Option<CancellationToken>,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently handled requests; excess requests
/// queue in the limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/jobs", post(api::create_job))
        .route("/api/jobs/{task_id}", get(api::get_job))
        .route(
            "/api/extensions",
            post(api::create_extension).get(api::list_extensions),
        )
        .route("/api/extensions/{task_id}", get(api::get_extension))
        .route("/api/scopes/{scope}/tasks", get(api::scope_tasks))
        .route("/api/tasks/{id}", delete(api::delete_task))
        .route("/api/tasks/{id}/template", get(api::task_template))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Open the configured task store.
async fn open_store(
    kind: StoreKind,
    config: &TasksConfig,
) -> tasks::StoreResult<Arc<dyn TaskStore>> {
    match kind {
        StoreKind::File => {
            let store = FileTaskStore::load(config.store_path.clone()).await?;
            info!(path = %store.path().display(), tasks = store.len().await, "task store loaded");
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            warn!("using in-memory task store, tasks are lost on restart");
            Ok(Arc::new(MemoryTaskStore::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting task-gateway");

    // Recorder must exist before the first counter is touched
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        store = ?config.tasks.store,
        credentials = config.credentials.len(),
        "configuration loaded"
    );

    // Initializing -> OpeningStore
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
            store: config.tasks.store,
        },
    );
    state = new_state;

    let kind = match action {
        ServiceAction::OpenStore { kind } => kind,
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    };

    let store = match open_store(kind, &config.tasks).await {
        Ok(store) => store,
        Err(e) => {
            error!(
                error = %e,
                path = %config.tasks.store_path.display(),
                "failed to open task store"
            );
            let (_state, action) = handle_event(state, ServiceEvent::StoreFailed(e.to_string()));
            if let ServiceAction::Shutdown { exit_code } = action {
                std::process::exit(exit_code);
            }
            anyhow::bail!("failed to open task store: {e}");
        }
    };

    // OpeningStore -> Starting
    let (new_state, action) = handle_event(state, ServiceEvent::StoreReady);
    state = new_state;

    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action after StoreReady: {action:?}"),
    };

    let pool = Arc::new(
        CredentialPool::new(config.credentials.clone()).context("invalid credential pool")?,
    );
    let issuer =
        TokenIssuer::new(config.upstream.token_ttl_secs).context("invalid token lifetime")?;
    let upstream = HttpUpstream::new(
        reqwest::Client::new(),
        config.upstream.base_url.as_str(),
        config.upstream.paths(),
        config.upstream.timeout(),
        Arc::clone(&pool),
        issuer,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(upstream),
        pool,
        store,
        OrchestratorConfig {
            page_size: config.tasks.page_size,
            poll_interval: config.tasks.poll_interval(),
        },
    ));

    let pollers = CancellationToken::new();
    let metrics = ServiceMetrics::new();

    let app_state = AppState {
        orchestrator,
        metrics: metrics.clone(),
        default_scope: Arc::from(config.server.default_scope.as_str()),
        prometheus: prometheus_handle,
        watchers: config.tasks.watch.then(|| pollers.clone()),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Starting -> Running
    let (new_state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    let in_flight = metrics.in_flight.clone();

    // The drain timer starts at signal receipt, not at server start: the
    // server is told to drain through the oneshot, then raced against it.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    info!(?action, "state: Draining");

    pollers.cancel();
    let _ = shutdown_tx.send(());

    let event = match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    let (_state, action) = handle_event(state, event);
    info!(?action, "shutdown complete");
    Ok(())
}

/// Health endpoint: status, credential pool, uptime, requests served.
/// Returns 503 when the pool is empty, since no submission can succeed.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let pool = state.orchestrator.pool();

    let (status_code, status) = if pool.is_empty() {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (axum::http::StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "pool": pool.status(),
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
