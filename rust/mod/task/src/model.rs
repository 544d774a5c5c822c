use std::fmt;
use std::str::FromStr;

use drivechat_core::{ServiceError, new_id};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

/// Longest command text accepted for a task.
pub const MAX_COMMAND_LEN: usize = 500;
/// Scheduling hint carried through to the executor; lower bound.
pub const MIN_PRIORITY: i32 = 1;
/// Scheduling hint carried through to the executor; upper bound.
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// PENDING → RUNNING → COMPLETED
///                   → FAILED
///         ↘ CANCELLED ↙
/// ```
///
/// COMPLETED, FAILED and CANCELLED are terminal: nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ServiceError::Validation(format!("unknown task status: {s}")))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskKind — the closed set of task categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Organize,
    Search,
    Cleanup,
    Backup,
    Analysis,
    FolderOperation,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        Self::Organize,
        Self::Search,
        Self::Cleanup,
        Self::Backup,
        Self::Analysis,
        Self::FolderOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organize => "organize",
            Self::Search => "search",
            Self::Cleanup => "cleanup",
            Self::Backup => "backup",
            Self::Analysis => "analysis",
            Self::FolderOperation => "folder_operation",
        }
    }
}

impl FromStr for TaskKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ServiceError::Validation(format!("unknown task type: {s}")))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A tracked unit of background work.
///
/// `id`, `owner`, `task_type`, `command` and `chat_id` never change after
/// creation. Everything else moves only through [`TaskPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub task_type: TaskKind,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub priority: i32,

    pub status: TaskStatus,
    /// Percentage 0–100. Only meaningful while RUNNING.
    #[serde(default)]
    pub progress: u8,

    /// Opaque payload for the executor.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Append-only.
    #[serde(default)]
    pub logs: Vec<String>,

    #[serde(default)]
    pub retries_used: u32,
    pub max_retries: u32,
    /// Executor's estimate in seconds. Carried, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u32>,

    /// Bumped on every stored write; conditional updates compare against it.
    #[serde(default)]
    pub revision: u64,

    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

/// Everything the caller supplies when a task is created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner: String,
    pub task_type: TaskKind,
    pub command: String,
    pub chat_id: Option<String>,
    pub priority: Option<i32>,
    pub parameters: Option<serde_json::Value>,
    pub max_retries: Option<u32>,
    pub estimated_duration: Option<u32>,
}

impl Task {
    /// Build a fresh PENDING task from validated input, assigning identity
    /// and timestamps.
    pub fn new_pending(new: NewTask, now: &str) -> Result<Task, ServiceError> {
        let command = new.command.trim();
        if command.is_empty() {
            return Err(ServiceError::Validation("command must not be empty".into()));
        }
        if command.chars().count() > MAX_COMMAND_LEN {
            return Err(ServiceError::Validation(format!(
                "command exceeds {MAX_COMMAND_LEN} characters"
            )));
        }

        let priority = new.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(ServiceError::Validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
            )));
        }

        let max_retries = new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(ServiceError::Validation(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}, got {max_retries}"
            )));
        }

        let parameters = match new.parameters {
            None | Some(serde_json::Value::Null) => serde_json::json!({}),
            Some(v @ serde_json::Value::Object(_)) => v,
            Some(_) => {
                return Err(ServiceError::Validation(
                    "parameters must be a JSON object".into(),
                ));
            }
        };

        Ok(Task {
            id: new_id(),
            owner: new.owner,
            task_type: new.task_type,
            command: command.to_string(),
            chat_id: new.chat_id.filter(|c| !c.trim().is_empty()),
            priority,
            status: TaskStatus::Pending,
            progress: 0,
            parameters,
            result: None,
            error_message: None,
            logs: Vec::new(),
            retries_used: 0,
            max_retries,
            estimated_duration: new.estimated_duration,
            revision: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            started_at: None,
            ended_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// TaskPatch — the only way a stored task changes
// ---------------------------------------------------------------------------

/// The externally mutable subset of a task: status, progress, result,
/// error message and logs (appended, never replaced).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub append_logs: Vec<String>,
}

impl TaskPatch {
    /// Apply to `task`, stamping `updated_at` (and `started_at` / `ended_at`
    /// on the matching status changes).
    pub fn apply(&self, task: &mut Task, now: &str) {
        if let Some(status) = self.status {
            if status != task.status {
                if status == TaskStatus::Running && task.started_at.is_none() {
                    task.started_at = Some(now.to_string());
                }
                if status.is_terminal() {
                    task.ended_at = Some(now.to_string());
                }
                task.status = status;
            }
        }
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
        if let Some(ref result) = self.result {
            task.result = Some(result.clone());
        }
        if let Some(ref error) = self.error_message {
            task.error_message = Some(error.clone());
        }
        task.logs.extend(self.append_logs.iter().cloned());
        task.updated_at = now.to_string();
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskKind>,
}

/// A clamped page request: `page >= 1`, `1 <= per_page <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Self {
        let page = page.unwrap_or(1).clamp(1, u32::MAX as i64) as u32;
        let per_page = per_page
            .unwrap_or(DEFAULT_PER_PAGE as i64)
            .clamp(1, MAX_PER_PAGE as i64) as u32;
        Self { page, per_page }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.per_page as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub per_page: Option<i64>,
}

impl TaskListQuery {
    /// Parse the filter values and clamp the page window.
    pub fn resolve(&self) -> Result<(TaskFilter, PageRequest), ServiceError> {
        let status = non_blank(&self.status)
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        let task_type = non_blank(&self.task_type)
            .map(str::parse::<TaskKind>)
            .transpose()?;
        Ok((
            TaskFilter { status, task_type },
            PageRequest::new(self.page, self.per_page),
        ))
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

/// One page of tasks, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub pagination: Pagination,
}

impl TaskPage {
    pub fn new(tasks: Vec<Task>, total: u64, page: PageRequest) -> Self {
        Self {
            tasks,
            pagination: Pagination {
                total,
                page: page.page,
                per_page: page.per_page,
                has_next: total > page.page as u64 * page.per_page as u64,
                has_prev: page.page > 1,
            },
        }
    }
}

/// Per-status counts for one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// Pending + running.
    pub fn active(&self) -> u64 {
        self.pending + self.running
    }
}

// ---------------------------------------------------------------------------
// API request types — caller-facing
// ---------------------------------------------------------------------------

/// Body for `POST /tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTaskRequest {
    /// Explicit task type. Inferred from the command when absent.
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    pub command: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Seconds, as estimated by the caller.
    #[serde(default)]
    pub estimated_duration: Option<u32>,
}

/// Body for `POST /tasks/{id}/@cancel`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Query parameters for `GET /tasks/{id}/@poll`.
#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Max seconds to block (default 30, capped by configuration).
    #[serde(default = "default_poll_timeout")]
    pub timeout: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for PollQuery {
    fn default() -> Self {
        Self {
            timeout: default_poll_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// API request types — executor-facing
// ---------------------------------------------------------------------------

/// Body for `PUT /tasks/{id}`: an out-of-band report from the executor.
///
/// Checked against the lifecycle table before anything is written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
