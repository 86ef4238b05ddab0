mod task_manager;
mod worker;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::sync::{watch, Mutex};
use anyhow::Result;
use tracing::{debug, error, info, warn};

pub use task_manager::TaskManager;
pub use worker::TaskWorker;
use crate::utils::time;

/// Owns the single control loop that decides what runs next.
pub struct TaskScheduler {
    task_manager: Arc<TaskManager>,
    running: Mutex<Option<LoopHandle>>,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskScheduler {
    pub fn new(task_manager: Arc<TaskManager>) -> Self {
        Self {
            task_manager,
            running: Mutex::new(None),
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Renews all tasks and spawns the control loop. No-op while running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Task scheduler already running");
            return Ok(());
        }

        self.task_manager.renew_all().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = TaskWorker::new(self.task_manager.clone());
        let handle = tokio::spawn(run_loop(self.task_manager.clone(), worker, shutdown_rx));
        *running = Some(LoopHandle { shutdown, handle });

        info!("Task scheduler started");
        Ok(())
    }

    /// Stops scheduling new runs; executions already started are not cancelled.
    /// Idempotent. A loop that does not exit in time is logged and left behind.
    pub async fn stop(&self) {
        let Some(LoopHandle { shutdown, handle }) = self.running.lock().await.take() else {
            return;
        };
        let _ = shutdown.send(true);

        let timeout = self.task_manager.config().stop_timeout;
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!("Task scheduler stopped"),
            Ok(Err(e)) => error!("Scheduler loop terminated abnormally: {}", e),
            Err(_) => warn!("Scheduler loop did not stop within {:?}", timeout),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

async fn run_loop(
    task_manager: Arc<TaskManager>,
    worker: TaskWorker,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = task_manager.config().clone();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match task_manager.next_candidate().await {
            Ok(Some(task)) => {
                let now = time::now_precise();
                if task.next_run_time <= now {
                    // stop() may have landed while the query was in flight
                    if *shutdown.borrow() {
                        break;
                    }
                    match worker.dispatch(task).await {
                        Ok(_) => {
                            failures = 0;
                            continue;
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = config.retry.delay(failures);
                            error!("Failed to dispatch task: {}, retrying in {:?}", e, delay);
                            delay
                        }
                    }
                } else {
                    failures = 0;
                    let remaining = (task.next_run_time - now).to_std().unwrap_or(Duration::ZERO);
                    debug!(task_id = task.id, "Next task due in {:?}", remaining);
                    remaining.min(config.max_wait)
                }
            }
            Ok(None) => {
                failures = 0;
                debug!("No scheduled tasks, idling");
                config.idle_wait
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = config.retry.delay(failures);
                error!("Failed to select next task: {}, retrying in {:?}", e, delay);
                delay
            }
        };

        tokio::select! {
            _ = task_manager.reload_signal().notified() => debug!("Reload signal received"),
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // scheduler dropped without stop()
                    break;
                }
            }
        }
    }

    info!("Scheduler loop exited");
}
