use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};

use drivechat_core::ServiceError;

use super::ApiState;
use crate::model::{
    CancelRequest, CreateTaskRequest, PollQuery, StatusCounts, Task, TaskListQuery, TaskPage,
    TaskUpdate,
};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/@poll", get(poll_task))
        .route("/tasks/{id}/@cancel", post(cancel_task))
}

// ---------------------------------------------------------------------------
// POST /tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ServiceError> {
    let principal = state.principal(&headers)?;
    let created = state.engine.create_task(&principal.owner_id, req).await?;
    Ok((StatusCode::CREATED, Json(created.task)))
}

// ---------------------------------------------------------------------------
// GET /tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<TaskPage>, ServiceError> {
    let principal = state.principal(&headers)?;
    let page = state.observer.get_tasks(&principal.owner_id, &query).await?;
    Ok(Json(page))
}

// ---------------------------------------------------------------------------
// GET /tasks/stats
// ---------------------------------------------------------------------------

async fn task_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<StatusCounts>, ServiceError> {
    let principal = state.principal(&headers)?;
    Ok(Json(state.observer.get_stats(&principal.owner_id).await?))
}

// ---------------------------------------------------------------------------
// GET /tasks/{id}
// ---------------------------------------------------------------------------

async fn get_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    let principal = state.principal(&headers)?;
    Ok(Json(state.engine.get_task(&principal.owner_id, &id).await?))
}

// ---------------------------------------------------------------------------
// PUT /tasks/{id}
// ---------------------------------------------------------------------------

async fn update_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Task>, ServiceError> {
    let principal = state.principal(&headers)?;
    let task = state
        .engine
        .apply_update(&principal.owner_id, &id, update)
        .await?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// DELETE /tasks/{id}
// ---------------------------------------------------------------------------

async fn delete_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let principal = state.principal(&headers)?;
    state.engine.delete_task(&principal.owner_id, &id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// POST /tasks/{id}/@cancel
// ---------------------------------------------------------------------------

/// The body is optional; an empty one cancels with the default reason.
async fn cancel_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ServiceError> {
    let principal = state.principal(&headers)?;
    let req: CancelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Validation(format!("invalid cancel body: {e}")))?
    };
    let task = state
        .engine
        .cancel_task(&principal.owner_id, &id, req.reason.as_deref())
        .await?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// GET /tasks/{id}/@poll
// ---------------------------------------------------------------------------

async fn poll_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Task>, ServiceError> {
    let principal = state.principal(&headers)?;
    let task = state
        .engine
        .poll(&principal.owner_id, &id, query.timeout)
        .await?;
    Ok(Json(task))
}
