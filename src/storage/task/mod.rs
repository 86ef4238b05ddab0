use async_trait::async_trait;
use anyhow::Result;
use chrono::NaiveDateTime;

use crate::schedule::types::{NewTask, Task, TaskId, TaskStatus};

pub mod sqlite;
pub mod mapping;

pub use sqlite::SqliteTaskStorage;

/// Durable task table. The only component that issues persistence writes.
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    /// Inserts a WAITING, active task and returns its id.
    async fn create(&self, task: &NewTask) -> Result<TaskId>;
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>>;
    /// All tasks ordered by `next_run_time` ascending.
    async fn list(&self) -> Result<Vec<Task>>;
    async fn delete(&self, task_id: TaskId) -> Result<bool>;
    /// Flips `is_active`; refuses finished one-shot tasks.
    async fn set_active(&self, task_id: TaskId, active: bool) -> Result<bool>;
    /// Earliest active, non-running task that is still eligible to run.
    async fn next_candidate(&self) -> Result<Option<Task>>;
    /// Marks an eligible task RUNNING and stamps `last_run_time`. False when the
    /// task is running, paused or a finished one-shot task.
    async fn claim(&self, task_id: TaskId, now: NaiveDateTime) -> Result<bool>;
    /// Records the end of a run (or a recovered run): new status and, for
    /// recurring tasks, the next occurrence.
    async fn finish_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        next_run_time: Option<NaiveDateTime>,
    ) -> Result<bool>;
    async fn update_next_run_time(&self, task_id: TaskId, next_run_time: NaiveDateTime) -> Result<bool>;
    /// WAITING one-shot task -> OVERDUE.
    async fn mark_overdue(&self, task_id: TaskId) -> Result<bool>;
    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    /// Deletes finished one-shot tasks whose last activity is before `before`.
    async fn cleanup_old(&self, before: NaiveDateTime) -> Result<u64>;
}
