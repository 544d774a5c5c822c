//! Read-only projection of an owner's tasks for display.
//!
//! Nothing here mutates a task. The observer either answers one-off reads
//! (`get_tasks`, `get_stats`, `snapshot`) or runs a polling subscription
//! (`watch`) that refreshes on a fixed interval until it is stopped.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use drivechat_core::{ServiceError, now_rfc3339};

use crate::config::TaskConfig;
use crate::engine::TaskEngine;
use crate::model::{
    PageRequest, Pagination, StatusCounts, Task, TaskFilter, TaskKind, TaskListQuery, TaskPage,
    TaskStatus,
};

/// A task as the UI shows it: progress only while running, and only the
/// tail of the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskKind,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub log_tail: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskView {
    pub fn from_task(task: &Task, log_tail: usize) -> Self {
        let skip = task.logs.len().saturating_sub(log_tail);
        Self {
            id: task.id.clone(),
            task_type: task.task_type,
            command: task.command.clone(),
            chat_id: task.chat_id.clone(),
            status: task.status,
            progress: (task.status == TaskStatus::Running).then_some(task.progress),
            log_tail: task.logs[skip..].to_vec(),
            result: task.result.clone(),
            error_message: task.error_message.clone(),
            created_at: task.created_at.clone(),
            updated_at: task.updated_at.clone(),
        }
    }
}

/// One consistent read: a page of task views plus the owner's counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub tasks: Vec<TaskView>,
    pub pagination: Pagination,
    pub stats: StatusCounts,
    pub taken_at: String,
}

/// What a subscriber sees.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    /// Last successful read. Survives failed polls.
    pub snapshot: Option<Snapshot>,
    /// Error from the most recent poll, cleared by the next success.
    pub last_error: Option<ServiceError>,
    /// Number of completed poll attempts, successful or not.
    pub polls: u64,
}

pub struct TaskObserver {
    engine: Arc<TaskEngine>,
    config: TaskConfig,
}

impl TaskObserver {
    pub fn new(engine: Arc<TaskEngine>, config: TaskConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub async fn get_tasks(
        &self,
        owner: &str,
        query: &TaskListQuery,
    ) -> Result<TaskPage, ServiceError> {
        let (filter, page) = query.resolve()?;
        self.engine.list_tasks(owner, filter, page).await
    }

    pub async fn get_stats(&self, owner: &str) -> Result<StatusCounts, ServiceError> {
        self.engine.stats(owner).await
    }

    pub async fn snapshot(
        &self,
        owner: &str,
        query: &TaskListQuery,
    ) -> Result<Snapshot, ServiceError> {
        let (filter, page) = query.resolve()?;
        read_snapshot(&self.engine, owner, filter, page, self.config.log_tail).await
    }

    /// Start polling `owner`'s tasks every `poll_interval_ms`.
    ///
    /// The first read happens immediately. A failed read does NOT clear the
    /// published snapshot: the error is recorded in `last_error` and logged,
    /// and the previous snapshot stays visible until a later poll succeeds.
    /// This is the one place in the module where an error is tolerated
    /// instead of returned.
    ///
    /// Invalid filter values and a missing owner are rejected up front.
    pub fn watch(&self, owner: &str, query: &TaskListQuery) -> Result<Subscription, ServiceError> {
        let owner = owner.trim().to_string();
        if owner.is_empty() {
            return Err(ServiceError::Unauthorized("missing owner identity".into()));
        }
        let (filter, page) = query.resolve()?;

        let (tx, rx) = watch::channel(ObservedState::default());
        let cancel = CancellationToken::new();

        let engine = Arc::clone(&self.engine);
        let token = cancel.clone();
        let period = self.config.poll_interval();
        let log_tail = self.config.log_tail;

        tokio::spawn(async move {
            debug!("task observer started for {owner} (interval={period:?})");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let read = read_snapshot(&engine, &owner, filter, page, log_tail).await;
                        tx.send_modify(|state| {
                            state.polls += 1;
                            match read {
                                Ok(snapshot) => {
                                    state.snapshot = Some(snapshot);
                                    state.last_error = None;
                                }
                                Err(e) => {
                                    warn!("task observer poll failed for {owner}, keeping last snapshot: {e}");
                                    state.last_error = Some(e);
                                }
                            }
                        });
                    }
                }
            }
            debug!("task observer stopped for {owner}");
        });

        Ok(Subscription { rx, cancel })
    }
}

async fn read_snapshot(
    engine: &TaskEngine,
    owner: &str,
    filter: TaskFilter,
    page: PageRequest,
    log_tail: usize,
) -> Result<Snapshot, ServiceError> {
    let listed = engine.list_tasks(owner, filter, page).await?;
    let stats = engine.stats(owner).await?;
    Ok(Snapshot {
        tasks: listed
            .tasks
            .iter()
            .map(|t| TaskView::from_task(t, log_tail))
            .collect(),
        pagination: listed.pagination,
        stats,
        taken_at: now_rfc3339(),
    })
}

/// Handle to a running observer loop. Dropping it stops the loop.
pub struct Subscription {
    rx: watch::Receiver<ObservedState>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Current state.
    pub fn state(&self) -> ObservedState {
        self.rx.borrow().clone()
    }

    /// Wait for the next poll. Returns `false` once the loop has ended.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
