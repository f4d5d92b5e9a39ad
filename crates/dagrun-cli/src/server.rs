//! Control-plane server
//!
//! Hosts the per-workflow lifecycle API and the queue endpoints, embeds
//! the cron scheduler, and runs the coordinator on its own internal
//! listener. `POST /shutdown` (or a termination signal) drains everything
//! gracefully.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use dagrun_core::{Config, Dag};
use dagrun_dispatch::{Coordinator, CoordinatorConfig, DispatchClient};
use dagrun_engine::{
    Controller, ControllerError, EngineContext, QueueManager, Scheduler,
};
use dagrun_storage::{FileRunStore, StoreError};

#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

/// Run the server until shut down.
pub async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    let store = Arc::new(FileRunStore::new(&config.data_dir));
    let dispatch_client = Arc::new(DispatchClient::new(config.coordinator_endpoints.clone())?);
    let engine = EngineContext::new(store, Arc::clone(&config))
        .with_dag_dir(&config.dags_dir)
        .with_dispatch_client(dispatch_client);
    let queues = QueueManager::new(&config);
    let controller = Arc::new(Controller::new(engine, queues));

    let shutdown = CancellationToken::new();

    // Scheduler over the definitions directory
    let dags = load_dags(&config.dags_dir);
    let scheduler = Scheduler::new(
        Arc::clone(&controller),
        dags,
        config.scheduler_timezone.as_deref(),
    )?;
    let scheduler_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    // Coordinator on the internal listener
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
        poll_timeout: config.poll_timeout(),
    }));
    let coordinator_listener = tokio::net::TcpListener::bind(config.coordinator_bind_addr())
        .await
        .with_context(|| format!("cannot bind coordinator on {}", config.coordinator_bind_addr()))?;
    info!(addr = %config.coordinator_bind_addr(), "coordinator listening");
    let coordinator_task = {
        let cancel = shutdown.clone();
        let router = coordinator.router();
        tokio::spawn(async move {
            let _ = axum::serve(coordinator_listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
        })
    };

    // Control plane
    let state = AppState {
        controller,
        config: Arc::clone(&config),
        shutdown: shutdown.clone(),
    };
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("cannot bind control plane on {}", config.bind_addr()))?;
    info!(addr = %config.bind_addr(), "control plane listening");

    let graceful = {
        let cancel = shutdown.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("termination signal received");
                    cancel.cancel();
                }
            }
        }
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(graceful)
        .await?;

    shutdown.cancel();
    let _ = scheduler_task.await;
    let _ = coordinator_task.await;
    info!("server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/shutdown", post(handle_shutdown))
        .route("/api/v1/dags/:name/status", get(handle_status))
        .route("/api/v1/dags/:name/start", post(handle_start))
        .route("/api/v1/dags/:name/stop", post(handle_stop))
        .route("/api/v1/dags/:name/restart", post(handle_restart))
        .route("/api/v1/dags/:name/retry", post(handle_retry))
        .route("/api/v1/queues", get(handle_queues))
        .route("/api/v1/queues/:name/clear", post(handle_queue_clear))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Definitions found in the dags directory; unreadable files are skipped.
fn load_dags(dir: &Path) -> Vec<Arc<Dag>> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        info!(dir = %dir.display(), "no definitions directory");
        return Vec::new();
    };

    let mut dags = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match Dag::load(&path) {
            Ok(dag) => dags.push(Arc::new(dag)),
            Err(e) => warn!(file = %path.display(), "skipping definition: {e}"),
        }
    }
    info!(count = dags.len(), "definitions loaded");
    dags
}

fn resolve_dag(state: &AppState, name: &str) -> Result<Arc<Dag>, (StatusCode, String)> {
    let path = state.config.dags_dir.join(format!("{name}.json"));
    if !path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            ControllerError::UnknownWorkflow(name.to_string()).to_string(),
        ));
    }
    Dag::load(&path)
        .map(Arc::new)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}

fn controller_error(e: ControllerError) -> (StatusCode, String) {
    let status = match &e {
        ControllerError::UnknownWorkflow(_) => StatusCode::NOT_FOUND,
        ControllerError::Store(StoreError::RunNotFound(_)) => StatusCode::NOT_FOUND,
        ControllerError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        ControllerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn handle_shutdown(State(state): State<AppState>) -> StatusCode {
    info!("shutdown requested");
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}

async fn handle_status(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let status = state
        .controller
        .get_status(&name)
        .await
        .map_err(controller_error)?;
    let recent = state
        .controller
        .get_recent_statuses(&name, 10)
        .await
        .map_err(controller_error)?;
    Ok(Json(serde_json::json!({
        "name": name,
        "status": status,
        "recent": recent,
    })))
}

#[derive(serde::Deserialize, Default)]
struct StartBody {
    params: Option<String>,
}

async fn handle_start(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    body: Option<Json<StartBody>>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let dag = resolve_dag(&state, &name)?;
    let params = body.and_then(|b| b.0.params);
    let workflow_id = state
        .controller
        .start(&dag, params.as_deref())
        .await
        .map_err(controller_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "workflow_id": workflow_id })),
    ))
}

async fn handle_stop(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .controller
        .stop(&name)
        .await
        .map_err(controller_error)?;
    Ok(StatusCode::OK)
}

async fn handle_restart(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let dag = resolve_dag(&state, &name)?;
    let workflow_id = state
        .controller
        .restart(&dag)
        .await
        .map_err(controller_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "workflow_id": workflow_id })),
    ))
}

#[derive(serde::Deserialize)]
struct RetryBody {
    run_id: Uuid,
}

async fn handle_retry(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<RetryBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let dag = resolve_dag(&state, &name)?;
    let workflow_id = state
        .controller
        .retry(&dag, body.run_id)
        .await
        .map_err(controller_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "workflow_id": workflow_id })),
    ))
}

async fn handle_queues(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "queues": state.controller.queues().list() }))
}

async fn handle_queue_clear(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Json<serde_json::Value> {
    let cleared = state.controller.queues().clear(&name);
    Json(serde_json::json!({ "cleared": cleared.len() }))
}
