pub mod schedule;
pub mod utils;
pub mod web;
pub mod storage;

use std::{env, sync::Arc};
use schedule::{TaskManager, TaskScheduler};
use once_cell::sync::Lazy;

pub struct AppContext {
    pub task_manager: Arc<TaskManager>,
    pub scheduler: Arc<TaskScheduler>,
}

const SCHED_SQLITE_PATH: &str = "./sched_data/tasks.db";
const SCHED_LOG_DIR: &str = "./logs";
const SCHED_HTTP_ADDR: &str = "127.0.0.1:7300";

fn env_or_dotenv(key: &str) -> Option<String> {
    env::var(key).or_else(|_| dotenv::var(key)).ok()
}

pub static SQLITE_PATH: Lazy<String> = Lazy::new(|| {
    env_or_dotenv("SCHED_SQLITE_PATH").unwrap_or_else(|| SCHED_SQLITE_PATH.to_string())
});

pub static LOG_DIR: Lazy<String> = Lazy::new(|| {
    env_or_dotenv("SCHED_LOG_DIR").unwrap_or_else(|| SCHED_LOG_DIR.to_string())
});

pub static HTTP_ADDR: Lazy<String> = Lazy::new(|| {
    env_or_dotenv("SCHED_HTTP_ADDR").unwrap_or_else(|| SCHED_HTTP_ADDR.to_string())
});

/// Webhook that receives task args; unset means runs are only logged.
pub static EXECUTOR_URL: Lazy<Option<String>> = Lazy::new(|| {
    env_or_dotenv("SCHED_EXECUTOR_URL").filter(|url| !url.trim().is_empty())
});

pub fn init_env() {
    dotenv::dotenv().ok();

    // 确保数据目录存在
    if let Some(dir) = std::path::Path::new(SQLITE_PATH.as_str()).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| {
                eprintln!("Failed to create database directory: {}", e);
            });
        }
    }
}
