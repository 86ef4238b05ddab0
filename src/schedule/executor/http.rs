use async_trait::async_trait;
use anyhow::Result;
use std::time::Duration;
use tracing::info;

use super::TaskExecutor;
use crate::schedule::types::TaskArgs;

/// Posts the task args as JSON to a webhook. Any non-2xx response fails the run.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
}

impl HttpExecutor {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn execute(&self, args: TaskArgs) -> Result<()> {
        let response = self.client.post(&self.url).json(&args).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Webhook {} returned status: {}", self.url, status));
        }

        info!("Webhook {} accepted task args", self.url);
        Ok(())
    }
}
