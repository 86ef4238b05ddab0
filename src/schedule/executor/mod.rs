pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use anyhow::Result;

use crate::schedule::types::TaskArgs;

pub use http::HttpExecutor;

/// Performs the effect of a task. The scheduler never interprets `args`.
///
/// Called concurrently for distinct tasks; an `Err` (or a panic) marks the
/// run as failed.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, args: TaskArgs) -> Result<()>;
}

#[async_trait]
impl<T: TaskExecutor + ?Sized> TaskExecutor for Arc<T> {
    async fn execute(&self, args: TaskArgs) -> Result<()> {
        (**self).execute(args).await
    }
}

/// Adapts a blocking closure; each call runs on tokio's blocking pool.
pub struct FnExecutor<F> {
    callback: Arc<F>,
}

impl<F> FnExecutor<F>
where
    F: Fn(TaskArgs) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskArgs) -> Result<()> + Send + Sync + 'static,
{
    async fn execute(&self, args: TaskArgs) -> Result<()> {
        let callback = self.callback.clone();
        tokio::task::spawn_blocking(move || callback(args)).await?
    }
}
