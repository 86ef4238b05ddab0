use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use anyhow::Result;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::mapping::{row_to_task, rows_to_tasks, TASK_COLUMNS};
use super::TaskStorage;
use crate::schedule::types::{NewTask, Task, TaskId, TaskStatus};
use crate::utils::time::format_time;

pub struct SqliteTaskStorage {
    pool: SqlitePool,
}

impl SqliteTaskStorage {
    /// Opens (or creates) the task database file at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing SQLite task storage at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Single-connection in-memory database, kept alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        // 创建任务表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '{}',
                next_run_time TEXT NOT NULL,
                interval TEXT,
                last_run_time TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'WAITING'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_next_run_time ON tasks (next_run_time)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn create(&self, task: &NewTask) -> Result<TaskId> {
        let args = serde_json::to_string(&task.args)?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (name, args, next_run_time, interval, is_active, status)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&task.name)
        .bind(args)
        .bind(format_time(&task.run_at))
        .bind(task.interval.map(|i| i.to_string()))
        .bind(TaskStatus::Waiting.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks ORDER BY next_run_time ASC, id ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_active(&self, task_id: TaskId, active: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET is_active = ?
            WHERE id = ?
            AND NOT (interval IS NULL AND status IN (?, ?, ?))
            "#,
        )
        .bind(active as i64)
        .bind(task_id)
        .bind(TaskStatus::Completed.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Overdue.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn next_candidate(&self) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE is_active = 1
            AND status != ?
            AND (interval IS NOT NULL OR status = ?)
            ORDER BY next_run_time ASC, id ASC
            LIMIT 1
            "#,
            TASK_COLUMNS
        ))
        .bind(TaskStatus::Running.as_str())
        .bind(TaskStatus::Waiting.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn claim(&self, task_id: TaskId, now: NaiveDateTime) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, last_run_time = ?
            WHERE id = ?
            AND is_active = 1
            AND status != ?
            AND (interval IS NOT NULL OR status = ?)
            "#,
        )
        .bind(TaskStatus::Running.as_str())
        .bind(format_time(&now))
        .bind(task_id)
        .bind(TaskStatus::Running.as_str())
        .bind(TaskStatus::Waiting.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        next_run_time: Option<NaiveDateTime>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                next_run_time = COALESCE(?, next_run_time)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(next_run_time.map(|t| format_time(&t)))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_next_run_time(&self, task_id: TaskId, next_run_time: NaiveDateTime) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET next_run_time = ? WHERE id = ?")
            .bind(format_time(&next_run_time))
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_overdue(&self, task_id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ? WHERE id = ? AND interval IS NULL AND status = ?",
        )
        .bind(TaskStatus::Overdue.as_str())
        .bind(task_id)
        .bind(TaskStatus::Waiting.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE status = ? ORDER BY next_run_time ASC, id ASC",
            TASK_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn cleanup_old(&self, before: NaiveDateTime) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE interval IS NULL
            AND status IN (?, ?, ?)
            AND COALESCE(last_run_time, next_run_time) < ?
            "#,
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Overdue.as_str())
        .bind(format_time(&before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
