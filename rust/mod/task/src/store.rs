use std::sync::Arc;

use async_trait::async_trait;
use drivechat_core::{ServiceError, now_rfc3339};
use drivechat_sql::{Row, SQLStore, Value};

use crate::model::{
    NewTask, PageRequest, StatusCounts, Task, TaskFilter, TaskPage, TaskPatch, TaskStatus,
};

/// Persistent task records, always addressed by `(owner, id)`.
///
/// A task that exists under another owner is reported exactly like one that
/// does not exist at all.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Assign identity and persist a new PENDING task.
    async fn create(&self, new: NewTask) -> Result<Task, ServiceError>;

    async fn get(&self, owner: &str, id: &str) -> Result<Task, ServiceError>;

    /// Newest-created first.
    async fn list(
        &self,
        owner: &str,
        filter: TaskFilter,
        page: PageRequest,
    ) -> Result<TaskPage, ServiceError>;

    /// Conditional update: apply `patch` only if the stored record is still
    /// at `expected_revision`, the revision the caller read and validated
    /// against. Returns `Ok(None)` when any write landed in between; nothing
    /// is written then.
    async fn update(
        &self,
        owner: &str,
        id: &str,
        expected_revision: u64,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, ServiceError>;

    async fn delete(&self, owner: &str, id: &str) -> Result<(), ServiceError>;

    async fn count_by_status(&self, owner: &str) -> Result<StatusCounts, ServiceError>;
}

// ---------------------------------------------------------------------------
// SQL implementation
// ---------------------------------------------------------------------------

/// SQL schema for the tasks table.
///
/// The full record lives in `data`; the other columns exist for filtering,
/// ordering and the compare-and-swap on `revision`.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    type        TEXT NOT NULL,
    status      TEXT NOT NULL,
    revision    INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_owner_created ON tasks(owner, created_at);
CREATE INDEX IF NOT EXISTS idx_task_owner_status ON tasks(owner, status);
";

/// Task store backed by a [`SQLStore`] (SQLite in production).
pub struct SqlTaskStore {
    db: Arc<dyn SQLStore>,
}

impl SqlTaskStore {
    /// Create the store and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        Ok(Self { db })
    }

    fn load(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data, revision FROM tasks WHERE id = ?1 AND owner = ?2",
                &[id.into(), owner.into()],
            )
            .map_err(storage)?;

        let row = rows.first().ok_or_else(|| not_found(id))?;
        let revision = row
            .get_i64("revision")
            .ok_or_else(|| ServiceError::Storage("missing revision column".into()))?;
        let mut task = row_to_task(row)?;
        task.revision = revision as u64;
        Ok(task)
    }
}

#[async_trait]
impl TaskStore for SqlTaskStore {
    async fn create(&self, new: NewTask) -> Result<Task, ServiceError> {
        let task = Task::new_pending(new, &now_rfc3339())?;
        let data = encode(&task)?;

        self.db
            .exec(
                "INSERT INTO tasks (id, owner, type, status, revision, created_at, data) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                &[
                    task.id.clone().into(),
                    task.owner.clone().into(),
                    task.task_type.as_str().into(),
                    task.status.as_str().into(),
                    task.created_at.clone().into(),
                    data.into(),
                ],
            )
            .map_err(storage)?;

        Ok(task)
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Task, ServiceError> {
        self.load(owner, id)
    }

    async fn list(
        &self,
        owner: &str,
        filter: TaskFilter,
        page: PageRequest,
    ) -> Result<TaskPage, ServiceError> {
        let mut where_sql = String::from("WHERE owner = ?1");
        let mut params: Vec<Value> = vec![owner.into()];

        if let Some(status) = filter.status {
            params.push(status.as_str().into());
            where_sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(kind) = filter.task_type {
            params.push(kind.as_str().into());
            where_sql.push_str(&format!(" AND type = ?{}", params.len()));
        }

        // Count total
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM tasks {where_sql}");
        let count_rows = self.db.query(&count_sql, &params).map_err(storage)?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .ok_or_else(|| ServiceError::Storage("missing cnt column".into()))?
            as u64;

        // Fetch page
        let idx = params.len() + 1;
        let select_sql = format!(
            "SELECT data FROM tasks {where_sql} \
             ORDER BY created_at DESC, rowid DESC LIMIT ?{idx} OFFSET ?{}",
            idx + 1
        );
        let mut select_params = params;
        select_params.push(Value::Integer(page.per_page as i64));
        select_params.push(Value::Integer(page.offset() as i64));

        let rows = self.db.query(&select_sql, &select_params).map_err(storage)?;
        let tasks = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TaskPage::new(tasks, total, page))
    }

    async fn update(
        &self,
        owner: &str,
        id: &str,
        expected_revision: u64,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, ServiceError> {
        let mut task = self.load(owner, id)?;
        if task.revision != expected_revision {
            return Ok(None);
        }

        patch.apply(&mut task, &now_rfc3339());
        task.revision = expected_revision + 1;
        let data = encode(&task)?;

        // The revision is re-checked inside the UPDATE itself, so a writer
        // that slipped in after the load above turns this into a no-op.
        let affected = self
            .db
            .exec(
                "UPDATE tasks SET data = ?1, status = ?2, revision = ?3 \
                 WHERE id = ?4 AND owner = ?5 AND revision = ?6",
                &[
                    data.into(),
                    task.status.as_str().into(),
                    Value::Integer(task.revision as i64),
                    id.into(),
                    owner.into(),
                    Value::Integer(expected_revision as i64),
                ],
            )
            .map_err(storage)?;

        Ok((affected == 1).then_some(task))
    }

    async fn delete(&self, owner: &str, id: &str) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM tasks WHERE id = ?1 AND owner = ?2",
                &[id.into(), owner.into()],
            )
            .map_err(storage)?;

        if affected == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn count_by_status(&self, owner: &str) -> Result<StatusCounts, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT status, COUNT(*) AS cnt FROM tasks WHERE owner = ?1 GROUP BY status",
                &[owner.into()],
            )
            .map_err(storage)?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: TaskStatus = row
                .get_str("status")
                .ok_or_else(|| ServiceError::Storage("missing status column".into()))?
                .parse()
                .map_err(|e| ServiceError::Storage(format!("bad status column: {e}")))?;
            let cnt = row
                .get_i64("cnt")
                .ok_or_else(|| ServiceError::Storage("missing cnt column".into()))?;
            counts.add(status, cnt as u64);
        }
        Ok(counts)
    }
}

fn storage(e: drivechat_sql::SQLError) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

fn not_found(id: &str) -> ServiceError {
    ServiceError::NotFound(format!("task {id} not found"))
}

fn encode(task: &Task) -> Result<String, ServiceError> {
    serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))
}

/// Deserialize a Task from a row's `data` JSON column.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad task json: {e}")))
}
