#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use tracing::{info, warn};
use std::sync::Arc;
use std::net::SocketAddr;
use sched_rs::{
    schedule::{FnExecutor, HttpExecutor, SchedulerConfig, TaskExecutor, TaskManager, TaskScheduler},
    storage::task::SqliteTaskStorage,
    utils::logger,
    AppContext, EXECUTOR_URL, HTTP_ADDR, LOG_DIR, SQLITE_PATH,
};

#[tokio::main]
async fn main() -> Result<()> {
    sched_rs::init_env();

    // 初始化日志系统
    let _guard = logger::init(LOG_DIR.clone())?;
    info!("Starting scheduler service {}...", env!("GIT_HASH"));

    // 初始化 storage
    info!("Initializing Storage at {}...", SQLITE_PATH.as_str());
    let storage = SqliteTaskStorage::new(SQLITE_PATH.as_str()).await?;

    // 选择执行器
    let executor: Arc<dyn TaskExecutor> = match EXECUTOR_URL.as_deref() {
        Some(url) => {
            let executor = HttpExecutor::new(url)?;
            info!("Dispatching task runs to {}", executor.url());
            Arc::new(executor)
        }
        None => {
            warn!("SCHED_EXECUTOR_URL is not set, task runs are only logged");
            Arc::new(FnExecutor::new(|args| {
                info!("Task fired with args {}", serde_json::Value::Object(args));
                Ok(())
            }))
        }
    };

    // 初始化任务管理器
    info!("Initializing Task Manager...");
    let task_manager = Arc::new(
        TaskManager::new(Arc::new(storage), executor).with_config(SchedulerConfig::from_env()),
    );

    // 创建应用上下文
    let ctx = Arc::new(AppContext {
        task_manager: task_manager.clone(),
        scheduler: Arc::new(TaskScheduler::new(task_manager)),
    });

    // 启动调度器
    info!("Starting Scheduler...");
    ctx.scheduler.start().await?;

    let addr: SocketAddr = HTTP_ADDR.parse()?;
    info!("Starting HTTP server at http://{}", addr);

    // 启动 HTTP 服务器，Ctrl-C 时退出
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let served = sched_rs::web::start_server(ctx.clone(), addr, shutdown).await;

    // 优雅关闭
    info!("Shutting down...");
    ctx.scheduler.stop().await;

    match served {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
