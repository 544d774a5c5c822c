use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};

use drivechat_core::ServiceError;

use super::ApiState;
use crate::command::{CommandOutcome, CommandRequest};

pub fn router() -> Router<ApiState> {
    Router::new().route("/commands", post(process_command))
}

// ---------------------------------------------------------------------------
// POST /commands
// ---------------------------------------------------------------------------

/// Only authentication can fail here; everything after it is reported in
/// the envelope with a 200.
async fn process_command(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandOutcome>, ServiceError> {
    let principal = state.principal(&headers)?;
    let outcome = state
        .commands
        .process_command(&principal.owner_id, &req.text, req.chat_id)
        .await;
    Ok(Json(outcome))
}
