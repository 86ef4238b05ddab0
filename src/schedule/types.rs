use std::fmt::Display;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::schedule::duration::{DurationError, Interval};
use crate::utils::time::{self, serde_time};

pub type TaskId = i64;

/// Opaque executor parameters, stored as a JSON object.
pub type TaskArgs = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Overdue,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Overdue => "OVERDUE",
        }
    }

    /// Terminal for one-shot tasks; recurring tasks never terminate.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Overdue)
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;
    fn try_from(status: &str) -> Result<Self, Self::Error> {
        match status {
            "WAITING" => Ok(TaskStatus::Waiting),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "OVERDUE" => Ok(TaskStatus::Overdue),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub args: TaskArgs,
    #[serde(with = "serde_time")]
    pub next_run_time: NaiveDateTime,
    pub interval: Option<Interval>,
    #[serde(with = "serde_time::option", default)]
    pub last_run_time: Option<NaiveDateTime>,
    pub is_active: bool,
    pub status: TaskStatus,
}

impl Task {
    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }

    /// A one-shot task that reached COMPLETED, FAILED or OVERDUE.
    pub fn is_finished(&self) -> bool {
        !self.is_recurring() && self.status.is_terminal()
    }
}

/// Validated input of `TaskManager::add_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub run_at: NaiveDateTime,
    pub interval: Option<Interval>,
    pub args: TaskArgs,
}

impl NewTask {
    pub fn new(name: impl Into<String>, run_at: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            run_at,
            interval: None,
            args: TaskArgs::new(),
        }
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    /// Builds a task from its wire representation
    /// (`YYYY-MM-DD HH:MM:SS` and `D HH:MM:SS`).
    pub fn parse(
        name: impl Into<String>,
        run_at: &str,
        interval: Option<&str>,
        args: TaskArgs,
    ) -> Result<Self, ScheduleError> {
        let run_at = time::parse_time(run_at)
            .map_err(|_| ScheduleError::InvalidTimestamp(run_at.to_string()))?;
        let interval = interval.map(str::parse::<Interval>).transpose()?;
        Ok(Self {
            name: name.into(),
            run_at,
            interval,
            args,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    InvalidInterval(#[from] DurationError),
    #[error("invalid timestamp {0:?}: expected \"YYYY-MM-DD HH:MM:SS\"")]
    InvalidTimestamp(String),
    #[error("interval must be longer than zero seconds")]
    ZeroInterval,
    #[error("timestamp {0:?} is outside years 0000-9999")]
    TimestampOutOfRange(String),
    #[error("interval {0} moves the next run past year 9999")]
    IntervalTooLarge(Interval),
}

/// Bounded exponential backoff for store writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // wait when nothing is scheduled, re-checks the store afterwards
    pub idle_wait: Duration,
    // ceiling for a single wait on a future candidate
    pub max_wait: Duration,
    // how long stop() waits for the loop to exit
    pub stop_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(3600),
            max_wait: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("SCHED_MAX_WAIT_MS") {
            config.max_wait = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_u64("SCHED_IDLE_WAIT_SECS") {
            config.idle_wait = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_u64("SCHED_STOP_TIMEOUT_MS") {
            config.stop_timeout = Duration::from_millis(ms);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv::var(key).ok())
        .and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub overdue: usize,
    pub inactive: usize,
}
