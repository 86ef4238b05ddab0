use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::schedule::duration::Interval;
use crate::schedule::types::{Task, TaskArgs, TaskStatus};
use crate::utils::time::parse_time;

pub const TASK_COLUMNS: &str =
    "id, name, args, next_run_time, interval, last_run_time, is_active, status";

pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let id: i64 = row.try_get("id")?;

    let args: String = row.try_get("args")?;
    let args: TaskArgs = serde_json::from_str(&args)
        .with_context(|| format!("task {} has malformed args", id))?;

    let next_run_time: String = row.try_get("next_run_time")?;
    let interval: Option<String> = row.try_get("interval")?;
    let last_run_time: Option<String> = row.try_get("last_run_time")?;
    let status: String = row.try_get("status")?;

    Ok(Task {
        id,
        name: row.try_get("name")?,
        args,
        next_run_time: parse_time(&next_run_time)
            .with_context(|| format!("task {} has malformed next_run_time", id))?,
        interval: interval
            .map(|i| i.parse::<Interval>())
            .transpose()
            .with_context(|| format!("task {} has malformed interval", id))?,
        last_run_time: last_run_time
            .map(|t| parse_time(&t))
            .transpose()
            .with_context(|| format!("task {} has malformed last_run_time", id))?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        status: TaskStatus::try_from(status.as_str()).map_err(|e| anyhow!(e))?,
    })
}

pub fn rows_to_tasks(rows: Vec<SqliteRow>) -> Result<Vec<Task>> {
    rows.iter().map(row_to_task).collect()
}
