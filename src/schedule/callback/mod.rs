use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::chapters::Chapter;
use crate::schedule::types::{JobStatus, ProcessingJob};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Notified once when a job reaches a terminal state.
#[async_trait]
pub trait JobCallback: Send + Sync {
    async fn on_complete(&self, job: &ProcessingJob, chapters: &[Chapter]) -> Result<()>;
    async fn on_error(&self, job: &ProcessingJob, error: &str) -> Result<()>;
    async fn on_cancelled(&self, job: &ProcessingJob) -> Result<()>;
}

/// Posts a JSON payload to the job's `callback_url`.
pub struct HttpCallback {
    client: reqwest::Client,
    callback_url: String,
}

#[derive(Debug, Serialize)]
struct CallbackPayload<'a, T> {
    job_id: &'a str,
    video_id: &'a str,
    status: JobStatus,
    data: T,
}

impl HttpCallback {
    pub fn new(client: reqwest::Client, callback_url: impl Into<String>) -> Self {
        Self {
            client,
            callback_url: callback_url.into(),
        }
    }

    /// Callback for `job`, if it asked for one.
    pub fn for_job(client: &reqwest::Client, job: &ProcessingJob) -> Option<Self> {
        job.config
            .callback_url
            .as_ref()
            .map(|url| Self::new(client.clone(), url.clone()))
    }

    async fn send_callback<T: Serialize + Send>(&self, payload: CallbackPayload<'_, T>) -> Result<()> {
        let response = self
            .client
            .post(&self.callback_url)
            .timeout(CALLBACK_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(
                job_id = payload.job_id,
                status = %response.status(),
                "Callback endpoint rejected the notification"
            );
            return Err(anyhow::anyhow!(
                "callback {} answered {}",
                self.callback_url,
                response.status()
            ));
        }
        info!(job_id = payload.job_id, url = %self.callback_url, "Callback delivered");
        Ok(())
    }
}

#[async_trait]
impl JobCallback for HttpCallback {
    async fn on_complete(&self, job: &ProcessingJob, chapters: &[Chapter]) -> Result<()> {
        self.send_callback(CallbackPayload {
            job_id: &job.id,
            video_id: &job.video_id,
            status: JobStatus::Complete,
            data: chapters,
        })
        .await
    }

    async fn on_error(&self, job: &ProcessingJob, error: &str) -> Result<()> {
        self.send_callback(CallbackPayload {
            job_id: &job.id,
            video_id: &job.video_id,
            status: JobStatus::Error,
            data: error,
        })
        .await
    }

    async fn on_cancelled(&self, job: &ProcessingJob) -> Result<()> {
        self.send_callback(CallbackPayload {
            job_id: &job.id,
            video_id: &job.video_id,
            status: JobStatus::Cancelled,
            data: (),
        })
        .await
    }
}
