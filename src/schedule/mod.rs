use std::sync::Arc;


pub mod types;
pub mod duration;
pub mod renewal;
pub mod events;
pub mod executor;
pub mod scheduler;
#[cfg(test)]
mod tests;

// 重导出主要类型
pub use types::{
    NewTask, RetryPolicy, ScheduleError, SchedulerConfig, Task, TaskArgs, TaskId, TaskStats,
    TaskStatus,
};
pub use duration::{format_duration, parse_duration, DurationError, Interval};
pub use events::TaskEvent;

// 使用 storage 模块中的类型
pub use crate::storage::task::TaskStorage;

// 重导出执行器接口
pub use executor::{FnExecutor, HttpExecutor, TaskExecutor};

// 重导出调度器接口
pub use scheduler::{TaskManager, TaskScheduler};

// 提供便捷的构建方法
pub fn create_scheduler(
    storage: impl TaskStorage,
    executor: impl TaskExecutor,
    config: SchedulerConfig,
) -> TaskScheduler {
    let task_manager = TaskManager::new(Arc::new(storage), Arc::new(executor)).with_config(config);
    TaskScheduler::new(Arc::new(task_manager))
}
