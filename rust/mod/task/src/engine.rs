use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use drivechat_core::ServiceError;

use crate::classifier::infer_task;
use crate::model::{
    CreateTaskRequest, NewTask, PageRequest, StatusCounts, Task, TaskFilter, TaskKind, TaskPage,
    TaskPatch, TaskStatus, TaskUpdate,
};
use crate::store::TaskStore;

/// Log line stamped into a task cancelled without an explicit reason.
pub const DEFAULT_CANCEL_REASON: &str = "User requested cancellation";

// ---------------------------------------------------------------------------
// Trigger — notification mechanism for executors
// ---------------------------------------------------------------------------

/// Callback fired after a task is created, with the new task id.
///
/// Must not block. An in-process executor can use it to wake up instead of
/// polling; a remote one would spawn the outbound call.
pub type TriggerFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of [`TaskEngine::create_task`].
#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub task: Task,
    /// Human-readable confirmation quoting the originating command.
    pub acknowledgement: String,
}

// ---------------------------------------------------------------------------
// TaskEngine — state machine + notification center
// ---------------------------------------------------------------------------

/// The task lifecycle manager.
///
/// This is a **state machine**, not an executor. It is the only writer of
/// `status`: every mutation, whether from the owner (cancel, delete) or
/// from the external executor (claim, progress, complete, fail), is checked
/// against the transition table and then written with a conditional update
/// keyed on the revision of the record it was validated against.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    /// Woken on every lifecycle change (used by long-poll).
    notify: Arc<Notify>,
    trigger: Option<TriggerFn>,
    max_long_poll: Duration,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
            trigger: None,
            max_long_poll: Duration::from_secs(120),
        }
    }

    /// Install the creation trigger.
    pub fn with_trigger(mut self, trigger: TriggerFn) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Cap for [`poll`](Self::poll) waits.
    pub fn with_max_long_poll(mut self, max: Duration) -> Self {
        self.max_long_poll = max;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<Notify> {
        &self.notify
    }

    // =======================================================================
    // Owner-facing
    // =======================================================================

    /// Persist a new PENDING task for `owner`.
    ///
    /// Without an explicit `type` the type is inferred from the command, and
    /// whatever the command carries (`/organize Downloads` → `path`) is
    /// merged under the caller's own parameters.
    pub async fn create_task(
        &self,
        owner: &str,
        req: CreateTaskRequest,
    ) -> Result<CreatedTask, ServiceError> {
        let owner = require_owner(owner)?;
        let command = req.command.trim();
        if command.is_empty() {
            return Err(ServiceError::Validation("command must not be empty".into()));
        }

        let explicit = req
            .task_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let (task_type, parameters) = match explicit {
            Some(t) => (t.parse::<TaskKind>()?, req.parameters),
            None => {
                let inferred = infer_task(command);
                let merged = merge_parameters(inferred.parameters, req.parameters)?;
                (inferred.kind, Some(merged))
            }
        };

        let task = self
            .store
            .create(NewTask {
                owner: owner.to_string(),
                task_type,
                command: command.to_string(),
                chat_id: req.chat_id,
                priority: req.priority,
                parameters,
                max_retries: req.max_retries,
                estimated_duration: req.estimated_duration,
            })
            .await?;

        info!("task {} created: type={} owner={}", task.id, task.task_type, task.owner);
        self.notify.notify_waiters();

        if let Some(trigger) = &self.trigger {
            trigger(&task.id);
        }

        let acknowledgement = format!("Task created: {}. Monitor progress in Tasks.", task.command);
        Ok(CreatedTask {
            task,
            acknowledgement,
        })
    }

    pub async fn get_task(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
        self.store.get(require_owner(owner)?, id).await
    }

    pub async fn list_tasks(
        &self,
        owner: &str,
        filter: TaskFilter,
        page: PageRequest,
    ) -> Result<TaskPage, ServiceError> {
        self.store.list(require_owner(owner)?, filter, page).await
    }

    pub async fn stats(&self, owner: &str) -> Result<StatusCounts, ServiceError> {
        self.store.count_by_status(require_owner(owner)?).await
    }

    /// PENDING or RUNNING → CANCELLED, stamping the reason into the logs.
    ///
    /// Cancelling is advisory: the executor is expected to notice and stop,
    /// and any report it sends afterwards is rejected.
    pub async fn cancel_task(
        &self,
        owner: &str,
        id: &str,
        reason: Option<&str>,
    ) -> Result<Task, ServiceError> {
        let owner = require_owner(owner)?;
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCEL_REASON);
        let patch = TaskPatch {
            status: Some(TaskStatus::Cancelled),
            append_logs: vec![format!("Cancelled: {reason}")],
            ..Default::default()
        };

        // Retries only while other writes keep landing on an active task.
        loop {
            let task = self.store.get(owner, id).await?;
            if task.status.is_terminal() {
                warn!("cancel rejected: task {id} is already {}", task.status);
                return Err(ServiceError::InvalidState(format!(
                    "task {id} is already {}",
                    task.status
                )));
            }

            if let Some(cancelled) = self.store.update(owner, id, task.revision, &patch).await? {
                info!("task {id}: {} -> cancelled ({reason})", task.status);
                self.notify.notify_waiters();
                return Ok(cancelled);
            }
            debug!("task {id}: changed during cancel, re-checking");
        }
    }

    /// Remove a terminal task. Active tasks must be cancelled first.
    pub async fn delete_task(&self, owner: &str, id: &str) -> Result<(), ServiceError> {
        let owner = require_owner(owner)?;
        let task = self.store.get(owner, id).await?;
        if !task.status.is_terminal() {
            warn!("delete rejected: task {id} is still {}", task.status);
            return Err(ServiceError::InvalidState(format!(
                "task {id} is {}; cancel it first",
                task.status
            )));
        }

        self.store.delete(owner, id).await?;
        info!("task {id} deleted");
        self.notify.notify_waiters();
        Ok(())
    }

    // =======================================================================
    // Executor-facing
    // =======================================================================

    /// Validate an executor report against the transition table and write
    /// it.
    ///
    /// The write is conditional on the revision of the record the report was
    /// validated against. If any write landed in the meantime (a cancellation
    /// racing a completion, or a concurrent progress report) the report is
    /// re-validated against the fresh record, so the loser of a race sees the
    /// error it would have seen had it come second, and the winner's write
    /// stands.
    pub async fn apply_update(
        &self,
        owner: &str,
        id: &str,
        update: TaskUpdate,
    ) -> Result<Task, ServiceError> {
        let owner = require_owner(owner)?;

        loop {
            let task = self.store.get(owner, id).await?;
            let patch = plan_transition(&task, &update).inspect_err(|e| {
                warn!("update rejected for task {id} ({}): {e}", task.status);
            })?;

            if let Some(updated) = self.store.update(owner, id, task.revision, &patch).await? {
                if updated.status != task.status {
                    info!("task {id}: {} -> {}", task.status, updated.status);
                } else {
                    debug!("task {id}: progress={} logs+{}", updated.progress, patch.append_logs.len());
                }
                self.notify.notify_waiters();
                return Ok(updated);
            }
            debug!("task {id}: changed during update, re-validating");
        }
    }

    /// PENDING → RUNNING.
    pub async fn claim(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
        self.apply_update(
            owner,
            id,
            TaskUpdate {
                status: Some(TaskStatus::Running),
                ..Default::default()
            },
        )
        .await
    }

    /// Report progress on a RUNNING task, optionally with a log line.
    pub async fn report_progress(
        &self,
        owner: &str,
        id: &str,
        progress: u8,
        message: Option<String>,
    ) -> Result<Task, ServiceError> {
        self.apply_update(
            owner,
            id,
            TaskUpdate {
                progress: Some(i64::from(progress)),
                logs: message.map(|m| vec![m]),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn append_log(
        &self,
        owner: &str,
        id: &str,
        lines: Vec<String>,
    ) -> Result<Task, ServiceError> {
        self.apply_update(
            owner,
            id,
            TaskUpdate {
                logs: Some(lines),
                ..Default::default()
            },
        )
        .await
    }

    /// RUNNING → COMPLETED with a result payload.
    pub async fn complete(
        &self,
        owner: &str,
        id: &str,
        result: serde_json::Value,
    ) -> Result<Task, ServiceError> {
        self.apply_update(
            owner,
            id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                result: Some(result),
                ..Default::default()
            },
        )
        .await
    }

    /// RUNNING → FAILED with an error message.
    pub async fn fail(
        &self,
        owner: &str,
        id: &str,
        error: impl Into<String>,
    ) -> Result<Task, ServiceError> {
        self.apply_update(
            owner,
            id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error_message: Some(error.into()),
                ..Default::default()
            },
        )
        .await
    }

    // =======================================================================
    // Long-poll
    // =======================================================================

    /// Wait up to `timeout_secs` (capped) for the task to change, then return
    /// it. A terminal task is returned immediately.
    pub async fn poll(&self, owner: &str, id: &str, timeout_secs: u64) -> Result<Task, ServiceError> {
        let owner = require_owner(owner)?;
        let timeout = Duration::from_secs(timeout_secs).min(self.max_long_poll);
        let deadline = tokio::time::Instant::now() + timeout;

        // Register before reading: notify_waiters() stores no permit, so a
        // change between the read and the first select! would be missed.
        let mut notified = Box::pin(self.notify.notified());

        let snapshot = self.store.get(owner, id).await?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }

        loop {
            tokio::select! {
                _ = &mut notified => {
                    // Re-arm before reading, for the same reason as above.
                    notified = Box::pin(self.notify.notified());
                    let current = self.store.get(owner, id).await?;
                    if current != snapshot {
                        return Ok(current);
                    }
                    // Some other task changed.
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return self.store.get(owner, id).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Check an executor report against the lifecycle table and turn it into
/// the patch to write.
///
/// | from    | to        | requires                      |
/// |---------|-----------|-------------------------------|
/// | pending | running   |                               |
/// | running | running   | progress 0–100, not decreasing|
/// | running | completed | `result`                      |
/// | running | failed    | `error_message`               |
///
/// Anything on a terminal task, or any other edge, is `InvalidState`.
/// Cancellation is not an executor report and is a `Validation` error here,
/// as is progress sent along with a terminal status.
pub fn plan_transition(task: &Task, update: &TaskUpdate) -> Result<TaskPatch, ServiceError> {
    let from = task.status;
    if from.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "task {} is already {from}",
            task.id
        )));
    }

    let logs: Vec<String> = update.logs.clone().unwrap_or_default();
    if update.status.is_none()
        && update.progress.is_none()
        && update.result.is_none()
        && update.error_message.is_none()
        && logs.is_empty()
    {
        return Err(ServiceError::Validation("update carries no changes".into()));
    }

    let to = update.status.unwrap_or(from);
    match (from, to) {
        (_, TaskStatus::Cancelled) => {
            return Err(ServiceError::Validation(
                "cancellation goes through the cancel operation".into(),
            ));
        }
        (TaskStatus::Pending, TaskStatus::Pending)
        | (TaskStatus::Pending, TaskStatus::Running)
        | (TaskStatus::Running, TaskStatus::Running)
        | (TaskStatus::Running, TaskStatus::Completed)
        | (TaskStatus::Running, TaskStatus::Failed) => {}
        _ => {
            return Err(ServiceError::InvalidState(format!(
                "task {} cannot move from {from} to {to}",
                task.id
            )));
        }
    }

    let progress = match update.progress {
        None => None,
        Some(p) => {
            if !(0..=100).contains(&p) {
                return Err(ServiceError::Validation(format!(
                    "progress must be between 0 and 100, got {p}"
                )));
            }
            if to.is_terminal() {
                return Err(ServiceError::Validation(format!(
                    "progress is not accepted together with status {to}"
                )));
            }
            if to != TaskStatus::Running {
                return Err(ServiceError::InvalidState(format!(
                    "progress can only be reported while running; task {} is {from}",
                    task.id
                )));
            }
            let p = p as u8;
            if from == TaskStatus::Running && p < task.progress {
                return Err(ServiceError::Validation(format!(
                    "progress must not decrease (current {}, got {p})",
                    task.progress
                )));
            }
            Some(p)
        }
    };

    if update.result.is_some() && to != TaskStatus::Completed {
        return Err(ServiceError::Validation(
            "result is only accepted on completion".into(),
        ));
    }
    if to == TaskStatus::Completed && update.result.is_none() {
        return Err(ServiceError::Validation("completion requires a result".into()));
    }

    let error_message = update
        .error_message
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty());
    if update.error_message.is_some() && to != TaskStatus::Failed {
        return Err(ServiceError::Validation(
            "error_message is only accepted on failure".into(),
        ));
    }
    if to == TaskStatus::Failed && error_message.is_none() {
        return Err(ServiceError::Validation("failure requires an error_message".into()));
    }

    Ok(TaskPatch {
        status: (to != from).then_some(to),
        progress,
        result: update.result.clone(),
        error_message: error_message.map(str::to_string),
        append_logs: logs,
    })
}

fn require_owner(owner: &str) -> Result<&str, ServiceError> {
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(ServiceError::Unauthorized("missing owner identity".into()));
    }
    Ok(owner)
}

/// Command-derived parameters overlaid by the caller's own.
fn merge_parameters(
    mut inferred: serde_json::Map<String, serde_json::Value>,
    caller: Option<serde_json::Value>,
) -> Result<serde_json::Value, ServiceError> {
    match caller {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Object(map)) => inferred.extend(map),
        Some(_) => {
            return Err(ServiceError::Validation(
                "parameters must be a JSON object".into(),
            ));
        }
    }
    Ok(serde_json::Value::Object(inferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqlTaskStore;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use drivechat_sql::SqliteStore;

    fn sql_store() -> Arc<SqlTaskStore> {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(SqlTaskStore::new(db).unwrap())
    }

    fn make_engine() -> TaskEngine {
        TaskEngine::new(sql_store())
    }

    fn request(command: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            command: command.into(),
            ..Default::default()
        }
    }

    async fn running_task(engine: &TaskEngine, owner: &str) -> Task {
        let created = engine.create_task(owner, request("/backup")).await.unwrap();
        engine.claim(owner, &created.task.id).await.unwrap()
    }

    #[tokio::test]
    async fn create_returns_pending_with_ack() {
        let engine = make_engine();
        let mut req = request("/backup");
        req.priority = Some(9);
        let created = engine.create_task("u1", req).await.unwrap();

        assert_eq!(created.task.status, TaskStatus::Pending);
        assert_eq!(created.task.progress, 0);
        assert_eq!(created.task.retries_used, 0);
        assert_eq!(created.task.priority, 9);
        assert_eq!(created.task.task_type, TaskKind::Backup);
        assert_eq!(
            created.acknowledgement,
            "Task created: /backup. Monitor progress in Tasks."
        );
    }

    #[tokio::test]
    async fn create_carries_estimated_duration() {
        let engine = make_engine();
        let mut req = request("/backup");
        req.estimated_duration = Some(300);
        let task = engine.create_task("u1", req).await.unwrap().task;
        assert_eq!(task.estimated_duration, Some(300));
        assert_eq!(
            engine.get_task("u1", &task.id).await.unwrap().estimated_duration,
            Some(300)
        );

        let plain = engine.create_task("u1", request("/backup")).await.unwrap().task;
        assert_eq!(plain.estimated_duration, None);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let engine = make_engine();
        assert!(matches!(
            engine.create_task("  ", request("/backup")).await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            engine.create_task("u1", request("   ")).await,
            Err(ServiceError::Validation(_))
        ));

        let mut req = request("/backup");
        req.task_type = Some("defrag".into());
        assert!(matches!(
            engine.create_task("u1", req).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_infers_type_and_merges_parameters() {
        let engine = make_engine();
        let mut req = request("/organize Downloads");
        req.parameters = Some(serde_json::json!({"path": "/override", "dry_run": true}));
        let task = engine.create_task("u1", req).await.unwrap().task;

        assert_eq!(task.task_type, TaskKind::Organize);
        assert_eq!(task.parameters["path"], "/override");
        assert_eq!(task.parameters["dry_run"], true);

        let mut req = request("/organize Downloads");
        req.task_type = Some("analysis".into());
        let task = engine.create_task("u1", req).await.unwrap().task;
        assert_eq!(task.task_type, TaskKind::Analysis);
        assert_eq!(task.parameters, serde_json::json!({}));
    }

    #[tokio::test]
    async fn trigger_fires_on_create() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let trigger: TriggerFn = Arc::new(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let engine = make_engine().with_trigger(trigger);

        engine.create_task("u1", request("/backup")).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Rejected creations do not fire.
        let _ = engine.create_task("u1", request("")).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_twice() {
        let engine = make_engine();
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;

        let cancelled = engine.cancel_task("u1", &task.id, None).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.ended_at.is_some());
        assert_eq!(
            cancelled.logs.last().map(String::as_str),
            Some("Cancelled: User requested cancellation")
        );

        assert!(matches!(
            engine.cancel_task("u1", &task.id, None).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn cancel_running_with_reason() {
        let engine = make_engine();
        let task = running_task(&engine, "u1").await;
        let cancelled = engine
            .cancel_task("u1", &task.id, Some("no longer needed"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.logs.iter().any(|l| l.contains("no longer needed")));
    }

    #[tokio::test]
    async fn delete_requires_terminal() {
        let engine = make_engine();
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;

        assert!(matches!(
            engine.delete_task("u1", &task.id).await,
            Err(ServiceError::InvalidState(_))
        ));

        engine.cancel_task("u1", &task.id, None).await.unwrap();
        engine.delete_task("u1", &task.id).await.unwrap();
        assert!(matches!(
            engine.get_task("u1", &task.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn executor_happy_path() {
        let engine = make_engine();
        let task = running_task(&engine, "u1").await;
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        for p in [10, 50, 90] {
            let t = engine
                .report_progress("u1", &task.id, p, Some(format!("at {p}")))
                .await
                .unwrap();
            assert_eq!(t.progress, p);
        }

        let done = engine
            .complete("u1", &task.id, serde_json::json!({"files": 12}))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"files": 12})));
        assert_eq!(done.logs, vec!["at 10", "at 50", "at 90"]);
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn fail_records_error() {
        let engine = make_engine();
        let task = running_task(&engine, "u1").await;
        let failed = engine.fail("u1", &task.id, "disk full").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk full"));
        assert!(failed.result.is_none());
    }

    #[tokio::test]
    async fn progress_after_cancel_is_rejected() {
        let engine = make_engine();
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;
        let cancelled = engine.cancel_task("u1", &task.id, None).await.unwrap();

        assert!(matches!(
            engine.report_progress("u1", &task.id, 50, None).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            engine.complete("u1", &task.id, serde_json::json!({})).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert_eq!(engine.get_task("u1", &task.id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn append_log_on_pending() {
        let engine = make_engine();
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;
        let t = engine
            .append_log("u1", &task.id, vec!["queued".into()])
            .await
            .unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.logs, vec!["queued"]);
    }

    fn sample_task(status: TaskStatus, progress: u8) -> Task {
        let mut task = Task::new_pending(
            NewTask {
                owner: "u1".into(),
                task_type: TaskKind::Backup,
                command: "/backup".into(),
                chat_id: None,
                priority: None,
                parameters: None,
                max_retries: None,
                estimated_duration: None,
            },
            "t0",
        )
        .unwrap();
        task.status = status;
        task.progress = progress;
        task
    }

    fn to(status: TaskStatus) -> TaskUpdate {
        TaskUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;

        let invalid = |from: TaskStatus, update: TaskUpdate| {
            matches!(
                plan_transition(&sample_task(from, 0), &update),
                Err(ServiceError::InvalidState(_))
            )
        };
        let validation = |from: TaskStatus, update: TaskUpdate| {
            matches!(
                plan_transition(&sample_task(from, 0), &update),
                Err(ServiceError::Validation(_))
            )
        };

        assert!(plan_transition(&sample_task(Pending, 0), &to(Running)).is_ok());
        assert!(invalid(Running, to(Pending)));
        assert!(invalid(Pending, TaskUpdate { result: Some(serde_json::json!(1)), ..to(Completed) }));
        assert!(invalid(Pending, TaskUpdate { error_message: Some("x".into()), ..to(Failed) }));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(invalid(terminal, to(Running)));
            assert!(invalid(terminal, TaskUpdate { logs: Some(vec!["x".into()]), ..Default::default() }));
        }

        assert!(validation(Running, to(Cancelled)));
        assert!(validation(Running, to(Completed)));
        assert!(validation(Running, to(Failed)));
        assert!(validation(Running, TaskUpdate { error_message: Some("  ".into()), ..to(Failed) }));
        assert!(validation(Running, TaskUpdate { result: Some(serde_json::json!(1)), ..to(Failed) }));
        assert!(validation(Running, TaskUpdate::default()));
        assert!(validation(Running, TaskUpdate { progress: Some(101), ..Default::default() }));
        assert!(validation(Running, TaskUpdate { progress: Some(-1), ..Default::default() }));
        assert!(invalid(Pending, TaskUpdate { progress: Some(5), ..Default::default() }));

        // Progress alongside a terminal status is a malformed report.
        let with_result = TaskUpdate {
            progress: Some(50),
            result: Some(serde_json::json!(1)),
            ..to(Completed)
        };
        assert!(validation(Running, with_result));
        let with_error = TaskUpdate {
            progress: Some(50),
            error_message: Some("x".into()),
            ..to(Failed)
        };
        assert!(validation(Running, with_error));
    }

    #[test]
    fn progress_is_monotonic_while_running() {
        let task = sample_task(TaskStatus::Running, 40);
        let back = TaskUpdate {
            progress: Some(30),
            ..Default::default()
        };
        assert!(matches!(
            plan_transition(&task, &back),
            Err(ServiceError::Validation(_))
        ));

        let same = TaskUpdate {
            progress: Some(40),
            ..Default::default()
        };
        let patch = plan_transition(&task, &same).unwrap();
        assert_eq!(patch.progress, Some(40));
        assert_eq!(patch.status, None);
    }

    #[test]
    fn claim_with_progress() {
        let patch = plan_transition(
            &sample_task(TaskStatus::Pending, 0),
            &TaskUpdate {
                progress: Some(5),
                ..to(TaskStatus::Running)
            },
        )
        .unwrap();
        assert_eq!(patch.status, Some(TaskStatus::Running));
        assert_eq!(patch.progress, Some(5));
    }

    /// Store wrapper that lands `competing` through the inner store right
    /// before the first conditional update reaches it, against the same
    /// revision.
    struct Racer {
        inner: Arc<SqlTaskStore>,
        competing: TaskPatch,
        raced: AtomicBool,
    }

    impl Racer {
        fn new(inner: &Arc<SqlTaskStore>, competing: TaskPatch) -> Self {
            Self {
                inner: Arc::clone(inner),
                competing,
                raced: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TaskStore for Racer {
        async fn create(&self, new: NewTask) -> Result<Task, ServiceError> {
            self.inner.create(new).await
        }
        async fn get(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
            self.inner.get(owner, id).await
        }
        async fn list(
            &self,
            owner: &str,
            filter: TaskFilter,
            page: PageRequest,
        ) -> Result<TaskPage, ServiceError> {
            self.inner.list(owner, filter, page).await
        }
        async fn update(
            &self,
            owner: &str,
            id: &str,
            expected_revision: u64,
            patch: &TaskPatch,
        ) -> Result<Option<Task>, ServiceError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner
                    .update(owner, id, expected_revision, &self.competing)
                    .await?;
            }
            self.inner.update(owner, id, expected_revision, patch).await
        }
        async fn delete(&self, owner: &str, id: &str) -> Result<(), ServiceError> {
            self.inner.delete(owner, id).await
        }
        async fn count_by_status(&self, owner: &str) -> Result<StatusCounts, ServiceError> {
            self.inner.count_by_status(owner).await
        }
    }

    /// A RUNNING task straight in the store, at `progress`.
    async fn stored_running(store: &SqlTaskStore, progress: u8) -> Task {
        let task = store
            .create(NewTask {
                owner: "u1".into(),
                task_type: TaskKind::Backup,
                command: "/backup".into(),
                chat_id: None,
                priority: None,
                parameters: None,
                max_retries: None,
                estimated_duration: None,
            })
            .await
            .unwrap();
        store
            .update(
                "u1",
                &task.id,
                task.revision,
                &TaskPatch {
                    status: Some(TaskStatus::Running),
                    progress: Some(progress),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn completion_losing_race_to_cancel_is_rejected() {
        let inner = sql_store();
        let task = stored_running(&inner, 0).await;

        let engine = TaskEngine::new(Arc::new(Racer::new(
            &inner,
            TaskPatch {
                status: Some(TaskStatus::Cancelled),
                ..Default::default()
            },
        )));

        let err = engine
            .complete("u1", &task.id, serde_json::json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let stored = inner.get("u1", &task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn progress_losing_race_to_higher_progress_is_rejected() {
        let inner = sql_store();
        let task = stored_running(&inner, 40).await;

        // 50 is valid against the 40 read, but 60 lands first.
        let engine = TaskEngine::new(Arc::new(Racer::new(
            &inner,
            TaskPatch {
                progress: Some(60),
                ..Default::default()
            },
        )));

        let err = engine
            .report_progress("u1", &task.id, 50, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let stored = inner.get("u1", &task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.progress, 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancel_and_complete_have_one_winner() {
        let engine = Arc::new(make_engine());
        let task = running_task(&engine, "u1").await;

        let (a, b) = {
            let e1 = Arc::clone(&engine);
            let e2 = Arc::clone(&engine);
            let id1 = task.id.clone();
            let id2 = task.id.clone();
            tokio::join!(
                tokio::spawn(async move { e1.cancel_task("u1", &id1, None).await }),
                tokio::spawn(async move {
                    e2.complete("u1", &id2, serde_json::json!({"n": 1})).await
                }),
            )
        };
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.is_ok() != b.is_ok(), "exactly one side must win");

        let stored = engine.get_task("u1", &task.id).await.unwrap();
        match (a, b) {
            (Ok(_), Err(e)) => {
                assert!(matches!(e, ServiceError::InvalidState(_)));
                assert_eq!(stored.status, TaskStatus::Cancelled);
                assert!(stored.result.is_none());
            }
            (Err(e), Ok(_)) => {
                assert!(matches!(e, ServiceError::InvalidState(_)));
                assert_eq!(stored.status, TaskStatus::Completed);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn other_owner_cannot_touch() {
        let engine = make_engine();
        let task = engine.create_task("owner-b", request("/backup")).await.unwrap().task;

        assert!(matches!(
            engine.get_task("owner-a", &task.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            engine.cancel_task("owner-a", &task.id, None).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            engine.claim("owner-a", &task.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert_eq!(
            engine.get_task("owner-b", &task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn poll_returns_terminal_immediately() {
        let engine = make_engine();
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;
        engine.cancel_task("u1", &task.id, None).await.unwrap();

        let polled = tokio::time::timeout(
            Duration::from_secs(1),
            engine.poll("u1", &task.id, 60),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(polled.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn poll_wakes_on_change() {
        let engine = Arc::new(make_engine());
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;

        let waiter = {
            let engine = Arc::clone(&engine);
            let id = task.id.clone();
            tokio::spawn(async move { engine.poll("u1", &id, 30).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.claim("u1", &task.id).await.unwrap();

        let polled = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(polled.status, TaskStatus::Running);
    }

    /// Store wrapper whose second `get` claims the task and signals the
    /// change before returning the record as it was just before.
    struct ChangeDuringRead {
        inner: Arc<SqlTaskStore>,
        notify: OnceLock<Arc<Notify>>,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl TaskStore for ChangeDuringRead {
        async fn create(&self, new: NewTask) -> Result<Task, ServiceError> {
            self.inner.create(new).await
        }
        async fn get(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
            let before = self.inner.get(owner, id).await?;
            if self.gets.fetch_add(1, Ordering::SeqCst) == 1 {
                let claim = TaskPatch {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                };
                self.inner.update(owner, id, before.revision, &claim).await?;
                if let Some(notify) = self.notify.get() {
                    notify.notify_waiters();
                }
            }
            Ok(before)
        }
        async fn list(
            &self,
            owner: &str,
            filter: TaskFilter,
            page: PageRequest,
        ) -> Result<TaskPage, ServiceError> {
            self.inner.list(owner, filter, page).await
        }
        async fn update(
            &self,
            owner: &str,
            id: &str,
            expected_revision: u64,
            patch: &TaskPatch,
        ) -> Result<Option<Task>, ServiceError> {
            self.inner.update(owner, id, expected_revision, patch).await
        }
        async fn delete(&self, owner: &str, id: &str) -> Result<(), ServiceError> {
            self.inner.delete(owner, id).await
        }
        async fn count_by_status(&self, owner: &str) -> Result<StatusCounts, ServiceError> {
            self.inner.count_by_status(owner).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_sees_change_signalled_during_reread() {
        let store = Arc::new(ChangeDuringRead {
            inner: sql_store(),
            notify: OnceLock::new(),
            gets: AtomicUsize::new(0),
        });
        let engine = Arc::new(TaskEngine::new(store.clone()));
        let _ = store.notify.set(Arc::clone(engine.notify()));
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;

        let started = tokio::time::Instant::now();
        let waiter = {
            let engine = Arc::clone(&engine);
            let id = task.id.clone();
            tokio::spawn(async move { engine.poll("u1", &id, 30).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // An unrelated change wakes the poller; its re-read is where the
        // claim lands.
        engine.create_task("u1", request("/search x")).await.unwrap();

        let polled = waiter.await.unwrap().unwrap();
        assert_eq!(polled.status, TaskStatus::Running);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_with_current_state() {
        let engine = make_engine().with_max_long_poll(Duration::from_secs(2));
        let task = engine.create_task("u1", request("/backup")).await.unwrap().task;

        let started = tokio::time::Instant::now();
        let polled = engine.poll("u1", &task.id, 600).await.unwrap();
        assert_eq!(polled.status, TaskStatus::Pending);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(600));
    }
}
