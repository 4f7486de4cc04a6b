//! Database connection management and embedded schema.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Channel substrate schema. Applied idempotently on every open.
const CHANNELS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channels (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    channel_type TEXT NOT NULL DEFAULT 'public',
    description TEXT NOT NULL DEFAULT '',
    created_by  TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_members (
    channel_id  TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    member_id   TEXT NOT NULL,
    role        TEXT NOT NULL DEFAULT 'member',
    joined_at   INTEGER NOT NULL,
    PRIMARY KEY (channel_id, member_id)
);

CREATE INDEX IF NOT EXISTS idx_channel_members_member
    ON channel_members(member_id);

CREATE TABLE IF NOT EXISTS channel_messages (
    id          TEXT PRIMARY KEY,
    channel_id  TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    sender_id   TEXT NOT NULL,
    content     TEXT NOT NULL,
    thread_id   TEXT,
    metadata    TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_channel_messages_channel_time
    ON channel_messages(channel_id, created_at);
CREATE INDEX IF NOT EXISTS idx_channel_messages_thread
    ON channel_messages(thread_id) WHERE thread_id IS NOT NULL;
";

/// Task-thread schema. Tasks are never deleted; logs and dependency edges
/// cascade with their task rows all the same so the constraint is explicit.
const TASKS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id                TEXT PRIMARY KEY,
    agent_id          TEXT NOT NULL,
    parent_task_id    TEXT REFERENCES tasks(id),
    objective         TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'active',
    priority          TEXT NOT NULL DEFAULT 'medium',
    progress_summary  TEXT NOT NULL DEFAULT '',
    artifacts         TEXT NOT NULL DEFAULT '[]',
    metadata          TEXT,
    last_heartbeat_at INTEGER,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL,
    completed_at      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent
    ON tasks(parent_task_id) WHERE parent_task_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS task_logs (
    id          TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    agent_id    TEXT NOT NULL,
    log_type    TEXT NOT NULL,
    message     TEXT NOT NULL,
    metadata    TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task_time
    ON task_logs(task_id, created_at);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id            TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on_task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, depends_on_task_id)
);

CREATE INDEX IF NOT EXISTS idx_task_dependencies_depends_on
    ON task_dependencies(depends_on_task_id);
";

/// Database bundle for the company core.
///
/// Channels and tasks live in separate files so chat traffic never contends
/// with task-thread writes. Both pools are WAL-mode with foreign keys on;
/// readers are unrestricted, writers serialize inside SQLite.
pub struct CompanyDb {
    pub channels: SqlitePool,
    pub tasks: SqlitePool,
}

impl CompanyDb {
    /// Open (or create) both databases under `<state>/company/` and apply
    /// the embedded schemas.
    pub async fn connect(state_dir: &Path) -> Result<Self> {
        let company_dir = state_dir.join("company");
        std::fs::create_dir_all(&company_dir).with_context(|| {
            format!("failed to create company directory: {}", company_dir.display())
        })?;

        let channels = open_pool(&company_dir.join("channels.db")).await?;
        let tasks = open_pool(&company_dir.join("tasks.db")).await?;

        sqlx::raw_sql(CHANNELS_SCHEMA)
            .execute(&channels)
            .await
            .context("failed to apply channels schema")?;
        sqlx::raw_sql(TASKS_SCHEMA)
            .execute(&tasks)
            .await
            .context("failed to apply tasks schema")?;

        Ok(Self { channels, tasks })
    }

    /// In-memory bundle for tests: same schema, no files.
    pub async fn connect_in_memory() -> Result<Self> {
        let channels = memory_pool().await?;
        let tasks = memory_pool().await?;

        sqlx::raw_sql(CHANNELS_SCHEMA)
            .execute(&channels)
            .await
            .context("failed to apply channels schema")?;
        sqlx::raw_sql(TASKS_SCHEMA)
            .execute(&tasks)
            .await
            .context("failed to apply tasks schema")?;

        Ok(Self { channels, tasks })
    }

    /// Close both pools gracefully. Pending acquires fail fast afterwards.
    pub async fn close(&self) {
        self.channels.close().await;
        self.tasks.close().await;
    }
}

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database: {}", path.display()))?;

    Ok(pool)
}

async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;

    Ok(pool)
}
