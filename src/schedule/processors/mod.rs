pub mod chapters;
pub mod extract;
pub mod finalize;
pub mod transcribe;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::chapters::Chapter;
use crate::error::PipelineError;
use crate::model::{ModelHandle, ModelKind, ModelManager};
use crate::schedule::progress::ProgressBroadcaster;
use crate::schedule::types::{ProcessingJob, Stage};
use crate::storage::{JobStorage, VideoInfo};
use crate::transcript::Transcript;

pub use chapters::GenerateChaptersProcessor;
pub use extract::ExtractAudioProcessor;
pub use finalize::FinalizeProcessor;
pub use transcribe::TranscribeProcessor;

/// State carried from one stage to the next during a single attempt.
pub struct StageContext {
    pub job: ProcessingJob,
    pub video: VideoInfo,
    /// Scratch directory owned by this job.
    pub work_dir: PathBuf,
    pub audio_path: Option<PathBuf>,
    pub transcript: Option<Transcript>,
    pub chapters: Vec<Chapter>,
    stage: Stage,
    broadcaster: Arc<ProgressBroadcaster>,
    storage: Arc<dyn JobStorage>,
}

impl StageContext {
    pub fn new(
        job: ProcessingJob,
        video: VideoInfo,
        work_dir: PathBuf,
        broadcaster: Arc<ProgressBroadcaster>,
        storage: Arc<dyn JobStorage>,
    ) -> Self {
        Self {
            job,
            video,
            work_dir,
            audio_path: None,
            transcript: None,
            chapters: Vec::new(),
            stage: Stage::ExtractingAudio,
            broadcaster,
            storage,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// Records that `fraction` (0..=1) of the current stage is done and
    /// publishes it unless throttled. Published updates are also persisted.
    pub async fn report(&mut self, fraction: f64) {
        let overall = self.broadcaster.weights().overall(self.stage, fraction);
        self.job
            .set_stage_progress(self.stage, fraction.clamp(0.0, 1.0) * 100.0, overall);
        if self.broadcaster.report(&self.job, self.stage) {
            if let Err(e) = self.storage.save_job(&self.job).await {
                warn!(job_id = %self.job.id, "Failed to persist progress: {}", e);
            }
        }
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;
    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError>;
    /// Called once the job has left the pipeline, whatever the outcome.
    async fn cleanup(&self, _ctx: &StageContext) {}
}

/// Acquires a model for `ctx`'s job, honoring its CPU fallback setting, and
/// records the device that served it.
pub(crate) async fn acquire_model(
    models: &ModelManager,
    kind: ModelKind,
    ctx: &mut StageContext,
) -> Result<ModelHandle, PipelineError> {
    let handle = if ctx.job.config.allow_cpu_fallback {
        models.acquire_with_fallback(kind).await?
    } else {
        models.acquire(kind).await?
    };
    ctx.job.metadata.devices.insert(kind, handle.device());
    Ok(handle)
}
