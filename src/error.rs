//! Error types for the chaptering pipeline.
//!
//! `PipelineError` is raised by stage executors and capability providers;
//! the job manager alone decides whether it is retried, escalated or
//! answered with the fallback. `JobError` is what the public job API returns.

use std::time::Duration;

use thiserror::Error;

use crate::model::ModelKind;
use crate::schedule::types::JobStatus;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("stage timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to load {kind} model: {reason}")]
    ModelLoad { kind: ModelKind, reason: String },

    #[error("invalid chapter output: {0}")]
    Validation(String),

    #[error("processing was cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn model_load(kind: ModelKind, reason: impl Into<String>) -> Self {
        Self::ModelLoad {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether the orchestrator may retry the stage that raised this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout(_))
    }

    /// Whether the chapter generation stage may answer this error with
    /// evenly spaced fallback chapters instead of failing the job.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::TransientIo(_) | Self::Timeout(_)
        )
    }

    /// Sentence stored in `ProcessingJob::error_message`.
    pub fn user_message(&self) -> String {
        match self {
            Self::TransientIo(msg) => {
                format!("A temporary storage or network failure did not recover: {}", msg)
            }
            Self::Timeout(limit) => format!(
                "Processing did not finish within {} seconds.",
                limit.as_secs()
            ),
            Self::ModelLoad { kind, .. } => {
                format!("The {} model could not be loaded.", kind)
            }
            Self::Validation(msg) => format!("Produced chapters were invalid: {}", msg),
            Self::Cancelled => "Processing was cancelled.".to_string(),
            Self::Fatal(msg) => msg.clone(),
            Self::Unknown(_) => "An unexpected internal error occurred.".to_string(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::TransientIo(err.to_string());
        }
        if err.is_decode() {
            return Self::Fatal(format!("provider returned an unreadable response: {}", err));
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Self::TransientIo(err.to_string())
            }
            Some(status) => Self::Fatal(format!("provider rejected the request ({})", status)),
            None => Self::TransientIo(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("video {video_id} is already being processed by job {job_id}")]
    AlreadyProcessing { video_id: String, job_id: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    #[error("video {video_id} cannot be processed: {reason}")]
    InvalidVideo { video_id: String, reason: String },

    #[error("invalid processing config: {0}")]
    InvalidConfig(String),

    #[error("cannot {action} job {job_id} while it is {status}")]
    InvalidState {
        job_id: String,
        action: &'static str,
        status: JobStatus,
    },

    #[error("job queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
