use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::{map_manager_error, AppError};
use crate::services::deployments::{
    HostIdentity, ProgressEvent, ProgressUpdate, RunInfo, RunPlan, RunStatus,
};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/deployments/runs", post(start_run).delete(reset_runs))
        .route("/deployments/runs/cancel", post(cancel_run))
        .route("/deployments/progress", get(list_progress))
        .route("/deployments/progress/stream", get(stream_progress))
        .route("/deployments/hosts/{host}", delete(drop_host))
        .route("/deployments/status", get(run_status))
}

#[derive(Debug, Serialize)]
pub(crate) struct CancelResponse {
    cancelled: bool,
}

pub(crate) async fn start_run(
    State(state): State<AppState>,
    Json(plan): Json<RunPlan>,
) -> Result<Json<RunInfo>, (StatusCode, String)> {
    let info = state
        .deployments
        .start_run(plan)
        .await
        .map_err(map_manager_error)?;
    Ok(Json(info))
}

pub(crate) async fn cancel_run(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.deployments.cancel_run().await,
    })
}

pub(crate) async fn reset_runs(State(state): State<AppState>) -> StatusCode {
    state.deployments.reset().await;
    StatusCode::NO_CONTENT
}

pub(crate) async fn list_progress(State(state): State<AppState>) -> Json<Vec<ProgressUpdate>> {
    Json(state.deployments.progress())
}

/// Replays the current snapshot, then follows live progress events.
pub(crate) async fn stream_progress(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.deployments.watch();
    let snapshot: Vec<ProgressEvent> = state
        .deployments
        .progress()
        .into_iter()
        .map(ProgressEvent::Updated)
        .collect();
    let live = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "progress stream lagged; events dropped");
            None
        }
    });
    let stream = tokio_stream::iter(snapshot)
        .chain(live)
        .map(|event| Event::default().event("progress").json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub(crate) async fn drop_host(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = state
        .deployments
        .drop_host(&HostIdentity::new(host.as_str()))
        .await
        .map_err(map_manager_error)?;
    if !removed {
        let message = format!("No progress recorded for host {}", host.trim());
        return Err(AppError::not_found(message).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn run_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.deployments.status().await)
}
