use chrono::NaiveDateTime;
use tokio::sync::broadcast;

use crate::schedule::types::{TaskId, TaskStatus};

/// Lifecycle notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Dispatched {
        task_id: TaskId,
        at: NaiveDateTime,
    },
    Finished {
        task_id: TaskId,
        status: TaskStatus,
        next_run_time: Option<NaiveDateTime>,
    },
    Overdue {
        task_id: TaskId,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Publishing without subscribers is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
