//! HTTP host interface: a small JSON/SSE API over the Supervisor and
//! Orchestrator.
//!
//! Grounded on `status_server.rs::build_router`/`ServerState`'s pattern —
//! one `Arc<AppState>` threaded through every handler via `State`, routes
//! registered on a single `Router` — generalized from one fixed `/status`
//! endpoint to the full task/orchestration surface, with `GET /events`
//! replacing a Tauri `Emitter::emit` push with an SSE stream backed by the
//! Ledger's broadcast channel (grounded on
//! `ferrex-server::scan_manager::scan_progress_sse`'s receiver-to-`Event`
//! mapping).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use foreman_core::error::{OrchestratorError, SupervisorError};
use foreman_core::ids::{OrchestrationId, TaskId};
use foreman_core::ledger::{Filter, Ledger};
use foreman_core::orchestrator::{decompose, Orchestrator};
use foreman_core::supervisor::SpawnOptions;

use crate::workspace_adapter::GitWorkspaceAdapter;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator<GitWorkspaceAdapter>>,
    pub ledger: Arc<Ledger>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(spawn_task).get(list_tasks))
        .route("/tasks/{id}", get(task_status))
        .route("/tasks/{id}/send", post(send_input))
        .route("/tasks/{id}/interrupt", post(interrupt_task))
        .route("/tasks/{id}/output", get(task_output))
        .route("/orchestrations", post(start_orchestration))
        .route("/orchestrations/{id}", get(orchestration_status))
        .route("/orchestrations/{id}/merge", post(merge_orchestration))
        .route("/orchestrations/{id}/abort", post(abort_orchestration))
        .route("/events", get(events_stream))
        .with_state(Arc::new(state))
}

#[derive(Deserialize)]
struct SpawnRequest {
    prompt: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<std::path::PathBuf>,
}

async fn spawn_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SpawnRequest>,
) -> Result<Json<Value>, ApiError> {
    let task_id = state
        .orchestrator
        .supervisor()
        .spawn(
            &req.prompt,
            SpawnOptions {
                command: req.command,
                args: req.args,
                cwd: req.cwd,
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(json!({"task_id": task_id.as_str()})))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let statuses = state.orchestrator.supervisor().status(None)?;
    Ok(Json(json!(statuses)))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id = TaskId::from(id);
    let statuses = state.orchestrator.supervisor().status(Some(&task_id))?;
    Ok(Json(json!(statuses.first())))
}

#[derive(Deserialize)]
struct SendRequest {
    text: String,
}

async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<StatusCode, ApiError> {
    let task_id = TaskId::from(id);
    state.orchestrator.supervisor().send(&task_id, req.text.as_bytes()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct InterruptRequest {
    follow_up: Option<String>,
}

async fn interrupt_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<InterruptRequest>>,
) -> Result<StatusCode, ApiError> {
    let task_id = TaskId::from(id);
    let follow_up = body.and_then(|Json(b)| b.follow_up);
    state
        .orchestrator
        .supervisor()
        .interrupt(&task_id, follow_up.as_deref().map(str::as_bytes))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct OutputQuery {
    tail: Option<usize>,
}

async fn task_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<OutputQuery>,
) -> Result<Vec<u8>, ApiError> {
    let task_id = TaskId::from(id);
    Ok(state.orchestrator.supervisor().output(&task_id, q.tail)?)
}

#[derive(Deserialize)]
struct OrchestrationRequest {
    prompt: String,
}

async fn start_orchestration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrchestrationRequest>,
) -> Result<Json<Value>, ApiError> {
    let parent_task_id = TaskId::new();
    let decomposition = decompose(parent_task_id, &req.prompt)?;
    let orchestration_id = state.orchestrator.execute(decomposition).await?;
    Ok(Json(json!({"orchestration_id": orchestration_id.as_str()})))
}

async fn orchestration_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let orchestration_id = OrchestrationId::from(id);
    let status = state.orchestrator.status(&orchestration_id)?;
    Ok(Json(json!(status)))
}

async fn merge_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let orchestration_id = OrchestrationId::from(id);
    state.orchestrator.merge(&orchestration_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn abort_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let orchestration_id = OrchestrationId::from(id);
    state.orchestrator.abort(&orchestration_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    kind: Option<String>,
}

/// Streams ledger events as they're appended. Grounded on
/// `ferrex-server::scan_manager::scan_progress_sse`'s receiver-to-`Event`
/// loop, swapping its `mpsc` receiver for the Ledger's `broadcast`
/// receiver and its progress struct for the Ledger's own `Event` type.
async fn events_stream(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Sse<impl futures_core::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let ledger = state.ledger.clone();
    let filter = Filter {
        kind: q.kind,
        refs: None,
    };
    let mut rx = ledger.subscribe(filter.clone());

    let stream = async_stream::stream! {
        loop {
            match ledger.next_matching(&mut rx, &filter).await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(SseEvent::default().event(event.kind.clone()).data(data));
                }
                Err(e) => {
                    log::warn!("events stream ended: {e}");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keep-alive"))
}

/// Uniform error response: every domain error serializes to `{"error": "..."}"`
/// with a status code chosen from the error's discriminant.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let status = match e {
            SupervisorError::InputError { .. } => StatusCode::BAD_REQUEST,
            SupervisorError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::NotRunning => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match e {
            OrchestratorError::OverlappingOutputs(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::MergeConflict(_) => StatusCode::CONFLICT,
            OrchestratorError::UnitsStillRunning => StatusCode::CONFLICT,
            OrchestratorError::AdapterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::config::Config;

    fn test_state() -> AppState {
        let config = Config::default();
        let ledger = Arc::new(Ledger::new(None, 100).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(GitWorkspaceAdapter::new(dir.path().to_path_buf(), None));
        let orchestrator = Arc::new(Orchestrator::new(config, ledger.clone(), adapter));
        AppState { orchestrator, ledger }
    }

    #[tokio::test]
    async fn spawn_rejects_disallowed_leading_verb() {
        let state = test_state();
        let result = spawn_task(
            State(Arc::new(state)),
            Json(SpawnRequest {
                prompt: "discuss the architecture".to_string(),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "sleep 1".to_string()],
                cwd: None,
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn task_status_for_unknown_id_is_404() {
        let state = test_state();
        let result = task_status(State(Arc::new(state)), Path("nonexistent".to_string())).await;
        match result {
            Err(ApiError(status, _)) => assert_eq!(status, StatusCode::NOT_FOUND),
            Ok(_) => panic!("expected error"),
        }
    }
}
