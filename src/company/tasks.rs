//! Task threads: durable units of agent work with logs, heartbeats, and
//! dependency edges (SQLite).

use crate::error::{CompanyError, Result};
use crate::events::TaskEvent;
use crate::now_ms;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Task lifecycle state. `done` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Blocked,
    Waiting,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TaskStatus::Active),
            "blocked" => Some(TaskStatus::Blocked),
            "waiting" => Some(TaskStatus::Waiting),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(TaskPriority::Critical),
            "high" => Some(TaskPriority::High),
            "medium" => Some(TaskPriority::Medium),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

/// Kind of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogType {
    Created,
    Updated,
    Progress,
    Checkpoint,
    Error,
    Heartbeat,
    Blocked,
    Unblocked,
    Completed,
    Failed,
    Reassigned,
}

impl TaskLogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLogType::Created => "created",
            TaskLogType::Updated => "updated",
            TaskLogType::Progress => "progress",
            TaskLogType::Checkpoint => "checkpoint",
            TaskLogType::Error => "error",
            TaskLogType::Heartbeat => "heartbeat",
            TaskLogType::Blocked => "blocked",
            TaskLogType::Unblocked => "unblocked",
            TaskLogType::Completed => "completed",
            TaskLogType::Failed => "failed",
            TaskLogType::Reassigned => "reassigned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(TaskLogType::Created),
            "updated" => Some(TaskLogType::Updated),
            "progress" => Some(TaskLogType::Progress),
            "checkpoint" => Some(TaskLogType::Checkpoint),
            "error" => Some(TaskLogType::Error),
            "heartbeat" => Some(TaskLogType::Heartbeat),
            "blocked" => Some(TaskLogType::Blocked),
            "unblocked" => Some(TaskLogType::Unblocked),
            "completed" => Some(TaskLogType::Completed),
            "failed" => Some(TaskLogType::Failed),
            "reassigned" => Some(TaskLogType::Reassigned),
            _ => None,
        }
    }
}

/// A durable task thread.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskThread {
    pub id: String,
    pub agent_id: String,
    pub parent_task_id: Option<String>,
    pub objective: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress_summary: String,
    pub artifacts: Vec<String>,
    pub dependencies: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub last_heartbeat_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// An append-only task history entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub log_type: TaskLogType,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Optional fields for `create_task`.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub parent_task_id: Option<String>,
    pub priority: Option<TaskPriority>,
    pub dependencies: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update applied by `update_task`. Unset fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub progress_summary: Option<String>,
    pub objective: Option<String>,
    pub agent_id: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Filters for `list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub agent_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub parent_task_id: Option<String>,
    pub limit: Option<i64>,
}

/// Paging options for `get_logs`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Page size; defaults to 100.
    pub limit: Option<i64>,
    /// Only entries strictly older than this timestamp.
    pub before: Option<i64>,
}

/// Org-wide counts for the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub stale: i64,
}

/// Per-agent counts plus the most recent heartbeat and update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskSummary {
    pub agent_id: String,
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub last_heartbeat_at: Option<i64>,
    pub last_updated_at: Option<i64>,
}

/// CRUD for task threads, logs, and dependency edges. Every committed
/// mutation emits a typed event carrying the full task record.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool, events: broadcast::Sender<TaskEvent>) -> Self {
        Self { pool, events }
    }

    /// Subscribe to this store's events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Create a task thread. Task row, dependency edges, and the `created`
    /// log land in one transaction.
    pub async fn create_task(
        &self,
        agent_id: &str,
        objective: &str,
        options: CreateTaskOptions,
    ) -> Result<TaskThread> {
        if agent_id.is_empty() {
            return Err(CompanyError::InvalidRequest(
                "agentId must not be empty".into(),
            ));
        }
        if objective.is_empty() {
            return Err(CompanyError::InvalidRequest(
                "objective must not be empty".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let priority = options.priority.unwrap_or(TaskPriority::Medium);

        let metadata_json = options
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| anyhow!("failed to encode task metadata: {error}"))?;

        let mut tx = self.pool.begin().await?;

        if let Some(parent_id) = &options.parent_task_id {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(CompanyError::InvalidRequest(format!(
                    "parentTaskId not found: {parent_id}"
                )));
            }
        }

        sqlx::query(
            "INSERT INTO tasks \
             (id, agent_id, parent_task_id, objective, status, priority, progress_summary, \
              artifacts, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'active', ?, '', '[]', ?, ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(&options.parent_task_id)
        .bind(objective)
        .bind(priority.as_str())
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for depends_on in &options.dependencies {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
                .bind(depends_on)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(CompanyError::InvalidRequest(format!(
                    "dependency task not found: {depends_on}"
                )));
            }
            sqlx::query(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id) \
                 VALUES (?, ?)",
            )
            .bind(&id)
            .bind(depends_on)
            .execute(&mut *tx)
            .await?;
        }

        insert_log(&mut tx, &id, agent_id, TaskLogType::Created, "Task created", None, now)
            .await?;

        tx.commit().await?;

        let task = self
            .get_task(&id)
            .await?
            .ok_or_else(|| anyhow!("task vanished after create: {id}"))?;

        let _ = self.events.send(TaskEvent::Created { task: task.clone() });
        Ok(task)
    }

    /// Full record or `None`.
    pub async fn get_task(&self, id: &str) -> Result<Option<TaskThread>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = task_from_row(&row)?;
        task.dependencies = self.get_dependencies(id).await?;
        Ok(Some(task))
    }

    /// Apply a partial update. Returns `None` for an unknown task.
    ///
    /// `updated_at` is clamped monotonic. A transition into `done`/`failed`
    /// sets `completed_at` once — the first terminal transition wins — and
    /// appends a matching log entry. A transition back out of a terminal
    /// state clears `completed_at` (the stamp and the status move in
    /// lockstep) and appends a reopen log entry.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<TaskThread>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let current = task_from_row(&row)?;

        let now = now_ms();
        let updated_at = now.max(current.updated_at);
        let status = patch.status.unwrap_or(current.status);
        let became_terminal = status.is_terminal() && !current.status.is_terminal();
        let reopened = !status.is_terminal() && current.status.is_terminal();
        let completed_at = if status.is_terminal() {
            // First terminal transition wins; repeats keep the stamp.
            current.completed_at.or(Some(now))
        } else {
            // Terminal status and completed_at hold together or not at all.
            None
        };

        let priority = patch.priority.unwrap_or(current.priority);
        let objective = patch.objective.unwrap_or(current.objective);
        let agent_id = patch.agent_id.unwrap_or(current.agent_id);
        let progress_summary = patch.progress_summary.unwrap_or(current.progress_summary);
        let artifacts = patch.artifacts.unwrap_or(current.artifacts);
        let metadata = patch.metadata.or(current.metadata);

        let artifacts_json = serde_json::to_string(&artifacts)
            .map_err(|error| anyhow!("failed to encode artifacts: {error}"))?;
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| anyhow!("failed to encode task metadata: {error}"))?;

        sqlx::query(
            "UPDATE tasks SET agent_id = ?, objective = ?, status = ?, priority = ?, \
             progress_summary = ?, artifacts = ?, metadata = ?, updated_at = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(&agent_id)
        .bind(&objective)
        .bind(status.as_str())
        .bind(priority.as_str())
        .bind(&progress_summary)
        .bind(&artifacts_json)
        .bind(&metadata_json)
        .bind(updated_at)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if became_terminal {
            let (log_type, message) = match status {
                TaskStatus::Done => (TaskLogType::Completed, "Task completed"),
                TaskStatus::Failed => (TaskLogType::Failed, "Task failed"),
                _ => unreachable!("terminal transition for non-terminal status"),
            };
            insert_log(&mut tx, id, &agent_id, log_type, message, None, now).await?;
        } else if reopened {
            insert_log(&mut tx, id, &agent_id, TaskLogType::Updated, "Task reopened", None, now)
                .await?;
        }

        tx.commit().await?;

        let task = self
            .get_task(id)
            .await?
            .ok_or_else(|| anyhow!("task vanished after update: {id}"))?;

        let _ = self.events.send(TaskEvent::Updated { task: task.clone() });
        if became_terminal {
            let event = match status {
                TaskStatus::Done => TaskEvent::Completed { task: task.clone() },
                _ => TaskEvent::Failed { task: task.clone() },
            };
            let _ = self.events.send(event);
        }

        Ok(Some(task))
    }

    /// Record liveness. Returns `None` for an unknown task. A provided
    /// `message` additionally lands as a `heartbeat` log entry.
    pub async fn heartbeat(
        &self,
        task_id: &str,
        agent_id: &str,
        message: Option<&str>,
    ) -> Result<Option<TaskThread>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT updated_at FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let current_updated_at: i64 = row.try_get("updated_at")?;

        let now = now_ms();
        sqlx::query("UPDATE tasks SET last_heartbeat_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now.max(current_updated_at))
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        if let Some(message) = message {
            insert_log(&mut tx, task_id, agent_id, TaskLogType::Heartbeat, message, None, now)
                .await?;
        }

        tx.commit().await?;

        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow!("task vanished after heartbeat: {task_id}"))?;

        let _ = self.events.send(TaskEvent::Heartbeat { task: task.clone() });
        Ok(Some(task))
    }

    /// Append a log entry and emit `task.log`.
    pub async fn append_log(
        &self,
        task_id: &str,
        agent_id: &str,
        log_type: TaskLogType,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskLog> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(CompanyError::NotFound(format!("task not found: {task_id}")));
        }

        let now = now_ms();
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| anyhow!("failed to encode log metadata: {error}"))?;

        let entry = TaskLog {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            log_type,
            message: message.to_string(),
            metadata,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO task_logs (id, task_id, agent_id, log_type, message, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(task_id)
        .bind(agent_id)
        .bind(log_type.as_str())
        .bind(message)
        .bind(&metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let _ = self.events.send(TaskEvent::Log {
            entry: entry.clone(),
        });
        Ok(entry)
    }

    /// Logs in ascending timestamp order. The internal query pages
    /// newest-first; the boundary reverses.
    pub async fn get_logs(&self, task_id: &str, query: LogQuery) -> Result<Vec<TaskLog>> {
        let limit = query.limit.unwrap_or(crate::config::DEFAULT_LOG_LIMIT);

        let rows = sqlx::query(
            "SELECT id, task_id, agent_id, log_type, message, metadata, created_at \
             FROM task_logs \
             WHERE task_id = ?1 AND (?2 IS NULL OR created_at < ?2) \
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )
        .bind(task_id)
        .bind(query.before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut logs = rows.iter().map(log_from_row).collect::<Result<Vec<_>>>()?;
        logs.reverse();
        Ok(logs)
    }

    /// Filter-and-list, most recently updated first.
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskThread>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.parent_task_id.is_some() {
            sql.push_str(" AND parent_task_id = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(parent_id) = &filter.parent_task_id {
            query = query.bind(parent_id);
        }
        query = query.bind(filter.limit.unwrap_or(crate::config::DEFAULT_TASK_LIST_LIMIT));

        let rows = query.fetch_all(&self.pool).await?;
        self.tasks_from_rows(rows).await
    }

    /// Active or blocked tasks whose heartbeat is missing or older than the
    /// threshold, excluding tasks younger than the threshold (they have not
    /// been expected to report yet). Oldest stalls first.
    pub async fn get_stale_tasks(&self, threshold_ms: i64) -> Result<Vec<TaskThread>> {
        let cutoff = now_ms() - threshold_ms;

        let rows = sqlx::query(
            "SELECT * FROM tasks \
             WHERE status IN ('active', 'blocked') \
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1) \
               AND created_at < ?1 \
             ORDER BY updated_at ASC, id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        self.tasks_from_rows(rows).await
    }

    /// Ids this task depends on.
    pub async fn get_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT depends_on_task_id FROM task_dependencies \
             WHERE task_id = ? ORDER BY depends_on_task_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Ids that depend on this task.
    pub async fn get_dependents(&self, task_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT task_id FROM task_dependencies \
             WHERE depends_on_task_id = ? ORDER BY task_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Add a dependency edge. Idempotent. Cycles are stored, not rejected;
    /// schedulers above the core decide policy.
    pub async fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<bool> {
        for id in [task_id, depends_on] {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(CompanyError::NotFound(format!("task not found: {id}")));
            }
        }

        let added = sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?)",
        )
        .bind(task_id)
        .bind(depends_on)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(added)
    }

    /// Remove a dependency edge. Idempotent.
    pub async fn remove_dependency(&self, task_id: &str, depends_on: &str) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?",
        )
        .bind(task_id)
        .bind(depends_on)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(removed)
    }

    /// Direct children in creation order.
    pub async fn get_subtasks(&self, parent_id: &str) -> Result<Vec<TaskThread>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE parent_task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        self.tasks_from_rows(rows).await
    }

    /// Org-wide counts per status plus the stale count at the default
    /// threshold.
    pub async fn get_summary(&self) -> Result<TaskSummary> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut by_status = BTreeMap::new();
        let mut total = 0;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            total += count;
            by_status.insert(status, count);
        }

        let stale = self
            .get_stale_tasks(crate::config::DEFAULT_STALE_THRESHOLD_MS)
            .await?
            .len() as i64;

        Ok(TaskSummary {
            total,
            by_status,
            stale,
        })
    }

    /// Per-agent counts and most recent heartbeat, ordered by agent id.
    pub async fn get_agent_summaries(&self) -> Result<Vec<AgentTaskSummary>> {
        let rows = sqlx::query(
            "SELECT agent_id, status, COUNT(*) AS count, \
                    MAX(last_heartbeat_at) AS last_beat, MAX(updated_at) AS last_update \
             FROM tasks GROUP BY agent_id, status ORDER BY agent_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries: Vec<AgentTaskSummary> = Vec::new();
        for row in rows {
            let agent_id: String = row.try_get("agent_id")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let last_beat: Option<i64> = row.try_get("last_beat")?;
            let last_update: Option<i64> = row.try_get("last_update")?;

            match summaries.last_mut() {
                Some(summary) if summary.agent_id == agent_id => {
                    summary.total += count;
                    summary.by_status.insert(status, count);
                    summary.last_heartbeat_at = max_option(summary.last_heartbeat_at, last_beat);
                    summary.last_updated_at = max_option(summary.last_updated_at, last_update);
                }
                _ => {
                    let mut by_status = BTreeMap::new();
                    by_status.insert(status, count);
                    summaries.push(AgentTaskSummary {
                        agent_id,
                        total: count,
                        by_status,
                        last_heartbeat_at: last_beat,
                        last_updated_at: last_update,
                    });
                }
            }
        }

        Ok(summaries)
    }

    async fn tasks_from_rows(&self, rows: Vec<SqliteRow>) -> Result<Vec<TaskThread>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task = task_from_row(&row)?;
            task.dependencies = self.get_dependencies(&task.id).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

fn max_option(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

async fn insert_log(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: &str,
    agent_id: &str,
    log_type: TaskLogType,
    message: &str,
    metadata: Option<&serde_json::Value>,
    created_at: i64,
) -> Result<()> {
    let metadata_json = metadata
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| anyhow!("failed to encode log metadata: {error}"))?;

    sqlx::query(
        "INSERT INTO task_logs (id, task_id, agent_id, log_type, message, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(task_id)
    .bind(agent_id)
    .bind(log_type.as_str())
    .bind(message)
    .bind(&metadata_json)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn task_from_row(row: &SqliteRow) -> Result<TaskThread> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let artifacts: String = row.try_get("artifacts")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(TaskThread {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        objective: row.try_get("objective")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown task status in row: {status}"))?,
        priority: TaskPriority::parse(&priority)
            .ok_or_else(|| anyhow!("unknown task priority in row: {priority}"))?,
        progress_summary: row.try_get("progress_summary")?,
        artifacts: serde_json::from_str(&artifacts)
            .map_err(|error| anyhow!("failed to decode artifacts: {error}"))?,
        dependencies: Vec::new(),
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|error| anyhow!("failed to decode task metadata: {error}"))?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<TaskLog> {
    let log_type: String = row.try_get("log_type")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(TaskLog {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        agent_id: row.try_get("agent_id")?,
        log_type: TaskLogType::parse(&log_type)
            .ok_or_else(|| anyhow!("unknown log type in row: {log_type}"))?,
        message: row.try_get("message")?,
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|error| anyhow!("failed to decode log metadata: {error}"))?,
        created_at: row.try_get("created_at")?,
    })
}
