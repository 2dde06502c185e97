//! Task queue collaborator
//!
//! A browse request may ask for queued dispatch: on start the bridge submits
//! the task and reports the returned id instead of running it inline.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub machine: String,
    pub path: String,
    pub prompt: String,
    pub engine: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub chat_id: String,
    pub thread_id: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a task and return its id
    async fn submit(&self, request: TaskRequest) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(alias = "id")]
    task_id: String,
}

/// Posts tasks to a queue service that answers `{ "taskId": "..." }`
#[derive(Debug, Clone)]
pub struct HttpTaskQueue {
    client: reqwest::Client,
    url: String,
}

impl HttpTaskQueue {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn submit(&self, request: TaskRequest) -> Result<String> {
        let resp = self.client.post(&self.url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("queue returned HTTP {}: {}", status.as_u16(), body.trim()));
        }
        let body: SubmitResponse = resp.json().await?;
        info!(task_id = %body.task_id, machine = %request.machine, "Task queued");
        Ok(body.task_id)
    }
}

/// Used when no queue is configured
#[derive(Debug, Default)]
pub struct UnconfiguredQueue;

#[async_trait]
impl TaskQueue for UnconfiguredQueue {
    async fn submit(&self, _request: TaskRequest) -> Result<String> {
        Err(anyhow!("no task queue is configured (set queueUrl)"))
    }
}
