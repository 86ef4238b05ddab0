use std::sync::Arc;
use std::time::Instant;
use tracing::{info, error, warn};
use anyhow::Result;

use crate::schedule::types::Task;
use super::TaskManager;

/// Runs claimed tasks off the control loop and records their outcome.
pub struct TaskWorker {
    task_manager: Arc<TaskManager>,
}

impl TaskWorker {
    pub fn new(task_manager: Arc<TaskManager>) -> Self {
        Self { task_manager }
    }

    /// Claims `task` and spawns its execution. Returns false when the task
    /// could not be claimed (deleted, paused or already running).
    pub async fn dispatch(&self, task: Task) -> Result<bool> {
        if !self.task_manager.claim(&task).await? {
            warn!(task_id = task.id, "Task could not be claimed, skipping");
            return Ok(false);
        }

        let task_manager = self.task_manager.clone();
        tokio::spawn(async move {
            Self::execute(task_manager, task).await;
        });
        Ok(true)
    }

    async fn execute(task_manager: Arc<TaskManager>, task: Task) {
        info!(task_id = task.id, name = %task.name, "Executing task");

        let executor = task_manager.executor().clone();
        let args = task.args.clone();
        let started = Instant::now();

        // the inner spawn turns a panicking executor into a JoinError
        let succeeded = match tokio::spawn(async move { executor.execute(args).await }).await {
            Ok(Ok(())) => {
                info!(task_id = task.id, elapsed = ?started.elapsed(), "Task completed successfully");
                true
            }
            Ok(Err(e)) => {
                error!(task_id = task.id, "Task failed: {:#}", e);
                false
            }
            Err(e) => {
                error!(task_id = task.id, "Task panicked: {}", e);
                false
            }
        };

        task_manager.complete_run(&task, succeeded).await;
    }
}
