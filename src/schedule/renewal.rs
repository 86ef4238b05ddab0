//! Renewal: brings stored due times and statuses up to date with the clock.
//!
//! Recurring tasks are moved forward with [`catch_up`], keeping their phase and
//! skipping the occurrences missed while the scheduler was down. One-shot
//! tasks whose time passed without running become OVERDUE.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, warn};

use crate::schedule::types::{Task, TaskId, TaskStatus};
use crate::storage::task::TaskStorage;
use crate::utils::time;

/// Smallest `next_run_time + k * interval` (k >= 0) that is not before `now`.
///
/// A due time in the future is returned unchanged. When the elapsed time is an
/// exact multiple of the interval the result equals `now` (due immediately).
pub fn catch_up(next_run_time: NaiveDateTime, interval_secs: u64, now: NaiveDateTime) -> NaiveDateTime {
    if next_run_time > now || interval_secs == 0 {
        return next_run_time;
    }
    let elapsed = (now - next_run_time).num_seconds().max(0) as u64;
    shift(next_run_time, elapsed.div_ceil(interval_secs), interval_secs)
}

/// Next occurrence after a run that was due at `next_run_time`.
///
/// Same as [`catch_up`] except that at least one interval always passes, so a
/// run finishing within its own due second is not fired again.
pub fn advance_after_run(next_run_time: NaiveDateTime, interval_secs: u64, now: NaiveDateTime) -> NaiveDateTime {
    if interval_secs == 0 {
        return next_run_time;
    }
    let elapsed = (now - next_run_time).num_seconds().max(0) as u64;
    shift(next_run_time, elapsed.div_ceil(interval_secs).max(1), interval_secs)
}

// saturates at the last storable instant so text ordering in the store holds
fn shift(from: NaiveDateTime, steps: u64, interval_secs: u64) -> NaiveDateTime {
    let latest = time::latest();
    steps
        .checked_mul(interval_secs)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| from.checked_add_signed(delta))
        .map_or(latest, |next| next.min(latest))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    /// Recurring tasks whose `next_run_time` moved forward.
    pub renewed: usize,
    /// One-shot tasks reclassified as OVERDUE.
    pub overdue: Vec<TaskId>,
    /// RUNNING rows left behind by a previous process.
    pub recovered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Missing,
    Unchanged,
    Renewed,
    /// Became OVERDUE during this renewal.
    Overdue,
    /// One-shot task already in a terminal status.
    Finished,
    Running,
}

/// Renews every stored task. Called once when the scheduler starts.
///
/// `in_flight` holds ids executing in this process; any other RUNNING row was
/// interrupted by a crash or kill and is recovered instead of being left stuck.
pub async fn renew_all(
    storage: &dyn TaskStorage,
    now: NaiveDateTime,
    in_flight: &HashSet<TaskId>,
) -> Result<RenewalReport> {
    let mut report = RenewalReport::default();

    for task in storage.list().await? {
        if task.status == TaskStatus::Running {
            if !in_flight.contains(&task.id) {
                recover_interrupted(storage, &task, now).await?;
                report.recovered += 1;
            }
            continue;
        }

        match renew_task(storage, &task, now).await? {
            RenewOutcome::Renewed => report.renewed += 1,
            RenewOutcome::Overdue => report.overdue.push(task.id),
            _ => {}
        }
    }

    Ok(report)
}

/// Renews a single task, e.g. before its activation flag changes.
pub async fn renew_one(storage: &dyn TaskStorage, task_id: TaskId, now: NaiveDateTime) -> Result<RenewOutcome> {
    match storage.get(task_id).await? {
        None => Ok(RenewOutcome::Missing),
        Some(task) if task.status == TaskStatus::Running => Ok(RenewOutcome::Running),
        Some(task) => renew_task(storage, &task, now).await,
    }
}

async fn renew_task(storage: &dyn TaskStorage, task: &Task, now: NaiveDateTime) -> Result<RenewOutcome> {
    match task.interval {
        Some(interval) => {
            let next = catch_up(task.next_run_time, interval.to_seconds(), now);
            if next == task.next_run_time {
                return Ok(RenewOutcome::Unchanged);
            }
            debug!(task_id = task.id, from = %task.next_run_time, to = %next, "Renewed recurring task");
            storage.update_next_run_time(task.id, next).await?;
            Ok(RenewOutcome::Renewed)
        }
        None if task.status.is_terminal() => Ok(RenewOutcome::Finished),
        None if task.next_run_time < now => {
            if storage.mark_overdue(task.id).await? {
                warn!(task_id = task.id, name = %task.name, due = %task.next_run_time, "Task is overdue");
                Ok(RenewOutcome::Overdue)
            } else {
                Ok(RenewOutcome::Unchanged)
            }
        }
        None => Ok(RenewOutcome::Unchanged),
    }
}

async fn recover_interrupted(storage: &dyn TaskStorage, task: &Task, now: NaiveDateTime) -> Result<()> {
    match task.interval {
        Some(interval) => {
            let next = catch_up(task.next_run_time, interval.to_seconds(), now);
            warn!(task_id = task.id, name = %task.name, next = %next, "Recovering interrupted recurring task");
            storage.finish_run(task.id, TaskStatus::Waiting, Some(next)).await?;
        }
        None => {
            warn!(task_id = task.id, name = %task.name, "Interrupted one-shot task marked as failed");
            storage.finish_run(task.id, TaskStatus::Failed, None).await?;
        }
    }
    Ok(())
}
