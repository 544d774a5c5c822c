mod commands;
mod tasks;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use drivechat_core::{Authenticator, Principal, ServiceError};

use crate::command::CommandRouter;
use crate::engine::TaskEngine;
use crate::observer::TaskObserver;

/// Everything the handlers reach. Cloned per request.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<TaskEngine>,
    pub observer: Arc<TaskObserver>,
    pub commands: Arc<CommandRouter>,
    pub auth: Arc<dyn Authenticator>,
}

impl ApiState {
    /// Every handler starts here, before any classification or storage
    /// access.
    fn principal(&self, headers: &HeaderMap) -> Result<Principal, ServiceError> {
        self.auth.authenticate(headers)
    }
}

/// Build the complete task module router.
///
/// Routes:
/// - `POST   /commands`              — classify and route chat input
/// - `POST   /tasks`                 — create task
/// - `GET    /tasks`                 — list tasks (paginated)
/// - `GET    /tasks/stats`           — per-status counts
/// - `GET    /tasks/{id}`            — get task
/// - `PUT    /tasks/{id}`            — executor status/progress report
/// - `DELETE /tasks/{id}`            — delete terminal task
/// - `POST   /tasks/{id}/@cancel`    — cancel task
/// - `GET    /tasks/{id}/@poll`      — long-poll
pub fn router(state: ApiState) -> Router {
    Router::new()
        .merge(tasks::router())
        .merge(commands::router())
        .with_state(state)
}
