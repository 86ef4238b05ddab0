use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDateTime, TimeDelta};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::schedule::events::{EventBus, TaskEvent};
use crate::schedule::executor::TaskExecutor;
use crate::schedule::renewal::{self, RenewOutcome, RenewalReport};
use crate::schedule::types::{
    NewTask, ScheduleError, SchedulerConfig, Task, TaskId, TaskStats, TaskStatus,
};
use crate::storage::task::TaskStorage;
use crate::utils::time;

/// Caller-facing side of the scheduler: task CRUD, renewal and run
/// bookkeeping. Every successful mutation raises the reload signal.
pub struct TaskManager {
    storage: Arc<dyn TaskStorage>,
    executor: Arc<dyn TaskExecutor>,
    reload: Notify,
    in_flight: Mutex<HashMap<TaskId, RunningInfo>>,
    events: EventBus,
    config: SchedulerConfig,
}

#[derive(Debug)]
struct RunningInfo {
    started_at: NaiveDateTime,
}

impl TaskManager {
    pub fn new(storage: Arc<dyn TaskStorage>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            storage,
            executor,
            reload: Notify::new(),
            in_flight: Mutex::new(HashMap::new()),
            events: EventBus::default(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub(crate) fn reload_signal(&self) -> &Notify {
        &self.reload
    }

    fn trigger_reload(&self) {
        // a stored permit coalesces any number of mutations into one wake-up
        self.reload.notify_one();
    }

    pub async fn add_task(&self, task: NewTask) -> Result<TaskId> {
        validate(&task)?;

        let task_id = self.storage.create(&task).await?;
        info!(
            task_id,
            name = %task.name,
            run_at = %time::format_time(&task.run_at),
            interval = ?task.interval.map(|i| i.to_string()),
            "Task added"
        );

        self.trigger_reload();
        Ok(task_id)
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Result<bool> {
        let deleted = self.storage.delete(task_id).await?;
        if deleted {
            info!(task_id, "Task deleted");
            self.trigger_reload();
        }
        Ok(deleted)
    }

    /// Pauses or resumes a task. Returns false for a missing task or a
    /// one-shot task that already finished (or turns out to be overdue).
    pub async fn activate_task(&self, task_id: TaskId, active: bool) -> Result<bool> {
        match renewal::renew_one(self.storage.as_ref(), task_id, time::now()).await? {
            RenewOutcome::Missing => {
                warn!(task_id, "Cannot change activation of missing task");
                return Ok(false);
            }
            RenewOutcome::Finished => return Ok(false),
            RenewOutcome::Overdue => {
                self.events.publish(TaskEvent::Overdue { task_id });
                self.trigger_reload();
                return Ok(false);
            }
            RenewOutcome::Renewed | RenewOutcome::Unchanged | RenewOutcome::Running => {}
        }

        let updated = self.storage.set_active(task_id, active).await?;
        if updated {
            info!(task_id, active, "Task activation changed");
            self.trigger_reload();
        }
        Ok(updated)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.storage.list().await
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.storage.get_by_status(status).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.storage.get(task_id).await
    }

    pub async fn task_stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats::default();

        for task in self.storage.list().await? {
            if !task.is_active {
                stats.inactive += 1;
            }
            match task.status {
                TaskStatus::Waiting => stats.waiting += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Overdue => stats.overdue += 1,
            }
        }

        Ok(stats)
    }

    /// Deletes finished one-shot tasks older than `retention_days`.
    /// Nothing is removed unless this is called.
    pub async fn cleanup_tasks(&self, retention_days: i64) -> Result<u64> {
        let cutoff = TimeDelta::try_days(retention_days)
            .and_then(|retention| time::now().checked_sub_signed(retention))
            .unwrap_or_else(time::earliest)
            .clamp(time::earliest(), time::latest());
        let removed = self.storage.cleanup_old(cutoff).await?;
        info!(removed, retention_days, "Cleaned up finished tasks");
        Ok(removed)
    }

    /// Startup renewal of every task, see [`renewal::renew_all`].
    pub async fn renew_all(&self) -> Result<RenewalReport> {
        let in_flight: HashSet<TaskId> = self.in_flight.lock().await.keys().copied().collect();
        let report = renewal::renew_all(self.storage.as_ref(), time::now(), &in_flight).await?;

        for task_id in &report.overdue {
            self.events.publish(TaskEvent::Overdue { task_id: *task_id });
        }
        info!(
            renewed = report.renewed,
            overdue = report.overdue.len(),
            recovered = report.recovered,
            "Renewed tasks"
        );

        if report.renewed > 0 || !report.overdue.is_empty() || report.recovered > 0 {
            self.trigger_reload();
        }
        Ok(report)
    }

    pub async fn next_candidate(&self) -> Result<Option<Task>> {
        self.storage.next_candidate().await
    }

    /// Number of executions currently running in this process.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Marks the task RUNNING. False if it was deleted, paused or is already running.
    pub(crate) async fn claim(&self, task: &Task) -> Result<bool> {
        let now = time::now();
        // hold the lock across the store update so renew_all never sees a
        // claimed row missing from the in-flight set
        let mut in_flight = self.in_flight.lock().await;
        if !self.storage.claim(task.id, now).await? {
            return Ok(false);
        }
        in_flight.insert(task.id, RunningInfo { started_at: now });
        drop(in_flight);

        self.events.publish(TaskEvent::Dispatched { task_id: task.id, at: now });
        Ok(true)
    }

    /// Persists the outcome of a run that was claimed from `task`.
    pub(crate) async fn complete_run(&self, task: &Task, succeeded: bool) {
        let now = time::now();
        let (status, next_run_time) = match task.interval {
            Some(interval) => (
                if succeeded { TaskStatus::Waiting } else { TaskStatus::Failed },
                Some(renewal::advance_after_run(task.next_run_time, interval.to_seconds(), now)),
            ),
            None => (
                if succeeded { TaskStatus::Completed } else { TaskStatus::Failed },
                None,
            ),
        };

        self.record_outcome(task.id, status, next_run_time).await;

        if let Some(info) = self.in_flight.lock().await.remove(&task.id) {
            debug!(task_id = task.id, started_at = %info.started_at, "Run finished");
        }
        self.events.publish(TaskEvent::Finished {
            task_id: task.id,
            status,
            next_run_time,
        });
        self.trigger_reload();
    }

    async fn record_outcome(&self, task_id: TaskId, status: TaskStatus, next_run_time: Option<NaiveDateTime>) {
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match self.storage.finish_run(task_id, status, next_run_time).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(task_id, "Task was deleted while running");
                    return;
                }
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(task_id, attempt, "Failed to record task outcome: {}, retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(task_id, %status, "Giving up recording task outcome after {} attempts: {}", attempt, e);
                    return;
                }
            }
        }
    }
}

fn validate(task: &NewTask) -> Result<(), ScheduleError> {
    if !time::is_storable(&task.run_at) {
        return Err(ScheduleError::TimestampOutOfRange(time::format_time(&task.run_at)));
    }
    let Some(interval) = task.interval else {
        return Ok(());
    };
    if interval.is_zero() {
        return Err(ScheduleError::ZeroInterval);
    }
    let first_repeat = i64::try_from(interval.to_seconds())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| task.run_at.checked_add_signed(delta));
    if !first_repeat.is_some_and(|next| time::is_storable(&next)) {
        return Err(ScheduleError::IntervalTooLarge(interval));
    }
    Ok(())
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        debug!("TaskManager is being dropped");
    }
}
