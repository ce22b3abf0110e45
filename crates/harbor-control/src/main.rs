//! Harbor orchestrator daemon.
//!
//! Runs the installation worker, the lifecycle controller and the disk
//! monitor, and serves health endpoints for the container supervisor.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use harbor_control::{
    AppMetaLoader, ComposeCli, DiskMonitor, EngineAdapter, EventBus, HostState, HttpStoreClient,
    InstallationWorker, LifecycleController, Orchestrator, OrchestratorConfig, ProxyConfigWriter,
};
use harbor_core::HostIdentity;
use harbor_store::{RocksStore, Store};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "harbord",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_apps() {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::warn!(error = %e, "Store not readable");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

fn host_identity(config: &OrchestratorConfig) -> HostIdentity {
    let key = config
        .host_key
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "harbor".to_string());
    HostIdentity::derive(key.as_bytes(), &config.base_domain)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harbor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting harbor orchestrator");

    let config = Arc::new(OrchestratorConfig::from_env());

    let store: Arc<dyn Store> = Arc::new(RocksStore::open(config.db_path())?);
    tracing::info!(path = %config.db_path().display(), "Initialized RocksDB store");

    let identity = host_identity(&config);
    tracing::info!(domain = %identity.domain(), "Derived host identity");

    let runtime = Arc::new(ComposeCli::new(&config.compose_command)?);
    let engine = Arc::new(EngineAdapter::new(
        runtime,
        Arc::clone(&store),
        config.installed_apps_dir(),
        config.start_throttle,
    ));
    let loader = Arc::new(AppMetaLoader::new(config.installed_apps_dir()));
    let proxy = Arc::new(ProxyConfigWriter::new(
        &config.proxy_config_path,
        config.proxy_settings(),
    ));
    let events = EventBus::default();
    let cancel = CancellationToken::new();

    let worker = InstallationWorker {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        engine: Arc::clone(&engine),
        store_client: Arc::new(HttpStoreClient::new(config.store_url.clone())?),
        loader: Arc::clone(&loader),
        proxy: Arc::clone(&proxy),
        identity: identity.clone(),
        events: events.clone(),
    };
    let (queue, worker_handle) = worker.spawn(cancel.child_token());

    let orchestrator = Orchestrator::new(Arc::clone(&config), Arc::clone(&store), queue, events);
    let requeued = orchestrator.recover_interrupted()?;
    if requeued > 0 {
        tracing::info!(requeued, "Recovered queued tasks");
    }

    proxy.refresh(store.as_ref(), &loader, &identity)?;

    let host = Arc::new(HostState::new(config.host_size));
    let disk_task = DiskMonitor::new(&config.data_dir, Arc::clone(&host))
        .spawn(config.disk_check_interval, cancel.child_token());

    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&store),
        engine,
        loader,
        host,
        config.max_concurrent_engine_calls,
        config.reconcile_interval,
    ));
    let controller_task = controller.run(cancel.child_token());

    let app = create_router(AppState {
        store: Arc::clone(&store),
    });

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    cancel.cancel();
    worker_handle.shutdown_and_join().await;
    for task in [disk_task, controller_task] {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    Ok(())
}
