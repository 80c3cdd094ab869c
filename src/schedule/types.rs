use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::model::{Device, ModelKind};

/// One step of the chaptering pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ExtractingAudio,
    Transcribing,
    GeneratingChapters,
    Finalizing,
}

impl Stage {
    pub const PIPELINE: [Stage; 4] = [
        Stage::ExtractingAudio,
        Stage::Transcribing,
        Stage::GeneratingChapters,
        Stage::Finalizing,
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::ExtractingAudio => 0,
            Stage::Transcribing => 1,
            Stage::GeneratingChapters => 2,
            Stage::Finalizing => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ExtractingAudio => "extracting_audio",
            Stage::Transcribing => "transcribing",
            Stage::GeneratingChapters => "generating_chapters",
            Stage::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    ExtractingAudio,
    Transcribing,
    GeneratingChapters,
    Finalizing,
    Complete,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The stage this status represents, if it is a running stage.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobStatus::ExtractingAudio => Some(Stage::ExtractingAudio),
            JobStatus::Transcribing => Some(Stage::Transcribing),
            JobStatus::GeneratingChapters => Some(Stage::GeneratingChapters),
            JobStatus::Finalizing => Some(Stage::Finalizing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::ExtractingAudio => "extracting_audio",
            JobStatus::Transcribing => "transcribing",
            JobStatus::GeneratingChapters => "generating_chapters",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl From<Stage> for JobStatus {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::ExtractingAudio => JobStatus::ExtractingAudio,
            Stage::Transcribing => JobStatus::Transcribing,
            Stage::GeneratingChapters => JobStatus::GeneratingChapters,
            Stage::Finalizing => JobStatus::Finalizing,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobStatus {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, anyhow::Error> {
        match s.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "extracting_audio" => Ok(JobStatus::ExtractingAudio),
            "transcribing" => Ok(JobStatus::Transcribing),
            "generating_chapters" => Ok(JobStatus::GeneratingChapters),
            "finalizing" => Ok(JobStatus::Finalizing),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Seconds; chapters closer than this are merged.
    pub min_chapter_length: f64,
    pub max_chapters: usize,
    /// Transcription language hint, e.g. "en".
    pub language: Option<String>,
    /// Free-text steering passed to the chapter generator.
    pub guidance_prompt: Option<String>,
    pub denoise: bool,
    pub allow_cpu_fallback: bool,
    pub callback_url: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            min_chapter_length: 30.0,
            max_chapters: 15,
            language: None,
            guidance_prompt: None,
            denoise: false,
            allow_cpu_fallback: false,
            callback_url: None,
        }
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        if !self.min_chapter_length.is_finite() || self.min_chapter_length <= 0.0 {
            return Err(JobError::InvalidConfig(
                "min_chapter_length must be a positive number of seconds".to_string(),
            ));
        }
        if self.max_chapters == 0 {
            return Err(JobError::InvalidConfig(
                "max_chapters must be at least 1".to_string(),
            ));
        }
        if let Some(url) = &self.callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(JobError::InvalidConfig(format!(
                    "callback_url must be an http(s) URL: {}",
                    url
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub stage_seconds: BTreeMap<Stage, f64>,
    pub stage_attempts: BTreeMap<Stage, u32>,
    pub devices: BTreeMap<ModelKind, Device>,
    pub transcript_utterances: Option<usize>,
    pub transcript_words: Option<usize>,
    pub transcript_language: Option<String>,
    pub generation_windows: Option<usize>,
    pub chapters_generated: Option<usize>,
    pub average_confidence: Option<f64>,
    pub used_fallback: bool,
    /// Messages of failures that were recovered from or ended an attempt.
    pub processing_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub video_id: String,
    pub attempt: u32,
    pub status: JobStatus,
    pub progress: f64,
    pub stage_progress: BTreeMap<Stage, f64>,
    pub config: ProcessingConfig,
    pub metadata: JobMetadata,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn fresh_stage_progress() -> BTreeMap<Stage, f64> {
    Stage::PIPELINE.iter().map(|stage| (*stage, 0.0)).collect()
}

impl ProcessingJob {
    pub fn new(video_id: impl Into<String>, config: ProcessingConfig) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job-{}", Uuid::new_v4()),
            video_id: video_id.into(),
            attempt: 1,
            status: JobStatus::Pending,
            progress: 0.0,
            stage_progress: fresh_stage_progress(),
            config,
            metadata: JobMetadata::default(),
            error_message: None,
            start_time: now,
            end_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn enter_stage(&mut self, stage: Stage) {
        if self.is_terminal() {
            return;
        }
        self.status = stage.into();
        self.updated_at = Utc::now();
    }

    /// Records intra-stage progress. Both the stage percentage and the
    /// overall percentage only move forward.
    pub fn set_stage_progress(&mut self, stage: Stage, stage_percent: f64, overall: f64) {
        if self.is_terminal() {
            return;
        }
        let entry = self.stage_progress.entry(stage).or_insert(0.0);
        *entry = entry.max(stage_percent.clamp(0.0, 100.0));
        self.progress = self.progress.max(overall.clamp(0.0, 100.0));
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = JobStatus::Complete;
        self.progress = 100.0;
        for value in self.stage_progress.values_mut() {
            *value = 100.0;
        }
        self.end_time = Some(now);
        self.updated_at = now;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        let message = message.into();
        self.metadata.processing_errors.push(message.clone());
        self.status = JobStatus::Error;
        self.error_message = Some(message);
        self.end_time = Some(now);
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.end_time = Some(now);
        self.updated_at = now;
    }

    /// Starts a new attempt on the same job id. Only valid from `error`;
    /// the caller checks the status.
    pub fn reset_for_restart(&mut self) {
        let now = Utc::now();
        let history = std::mem::take(&mut self.metadata.processing_errors);
        self.attempt += 1;
        self.status = JobStatus::Pending;
        self.progress = 0.0;
        self.stage_progress = fresh_stage_progress();
        self.metadata = JobMetadata {
            processing_errors: history,
            ..JobMetadata::default()
        };
        self.error_message = None;
        self.start_time = now;
        self.end_time = None;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEstimate {
    pub video_id: String,
    pub duration: f64,
    pub device: Device,
    pub per_stage_seconds: BTreeMap<Stage, f64>,
    pub total_seconds: f64,
}
