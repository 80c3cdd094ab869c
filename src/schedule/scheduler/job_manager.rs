use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::JobQueue;
use crate::chapters::{fallback_candidates, normalize_candidates, Chapter};
use crate::config::{Settings, StageTimeouts};
use crate::error::{JobError, PipelineError};
use crate::model::ModelManager;
use crate::schedule::callback::{HttpCallback, JobCallback};
use crate::schedule::estimate::ThroughputStats;
use crate::schedule::processors::{StageContext, StageProcessor};
use crate::schedule::progress::{JobSubscription, ProgressBroadcaster};
use crate::schedule::retry::RetryPolicy;
use crate::schedule::types::{JobStatus, ProcessingConfig, ProcessingEstimate, ProcessingJob, Stage};
use crate::storage::{JobStorage, VideoProvider};
use crate::web::Pagination;

const INTERRUPTED_MESSAGE: &str = "Processing was interrupted by a service restart.";
const PANIC_MESSAGE: &str = "An unexpected internal error occurred.";

#[derive(Debug, Clone)]
pub struct JobManagerOptions {
    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,
    /// Per-job scratch directories are created below this.
    pub work_dir: PathBuf,
}

impl Default for JobManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            work_dir: std::env::temp_dir().join("chapter-rs"),
        }
    }
}

impl JobManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: RetryPolicy::from_settings(settings),
            timeouts: settings.stage_timeouts.clone(),
            work_dir: settings.work_dir.clone(),
        }
    }
}

/// Bookkeeping for a job that is queued or running in this process.
#[derive(Debug, Default)]
struct ActiveJob {
    cancel: CancellationToken,
    // a worker has claimed the job
    running: bool,
    // all stages passed; the outcome is being persisted
    finishing: bool,
}

/// Drives processing jobs through the pipeline.
///
/// This is the only component that mutates job records while they are
/// active, and the only one that decides between retrying a stage, failing
/// the job and falling back to generated chapters.
pub struct JobManager {
    storage: Arc<dyn JobStorage>,
    videos: Arc<dyn VideoProvider>,
    models: Arc<ModelManager>,
    processors: HashMap<Stage, Box<dyn StageProcessor>>,
    broadcaster: Arc<ProgressBroadcaster>,
    queue: JobQueue,
    active: Mutex<HashMap<String, ActiveJob>>,
    // serializes the duplicate check in start/restart
    start_lock: Mutex<()>,
    options: JobManagerOptions,
    throughput: ThroughputStats,
    http: reqwest::Client,
}

impl JobManager {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        videos: Arc<dyn VideoProvider>,
        models: Arc<ModelManager>,
        broadcaster: Arc<ProgressBroadcaster>,
        options: JobManagerOptions,
    ) -> Self {
        Self {
            storage,
            videos,
            models,
            processors: HashMap::new(),
            broadcaster,
            queue: JobQueue::new(),
            active: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
            options,
            throughput: ThroughputStats::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn register_processor(&mut self, processor: Box<dyn StageProcessor>) {
        let stage = processor.stage();
        info!("Registering processor for stage: {}", stage);
        self.processors.insert(stage, processor);
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Creates a job for `video_id` and queues it. Returns the job id.
    pub async fn start(&self, video_id: &str, config: ProcessingConfig) -> Result<String, JobError> {
        config.validate()?;
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or_else(|| JobError::VideoNotFound(video_id.to_string()))?;
        if !video.duration.is_finite() || video.duration <= 0.0 {
            return Err(JobError::InvalidVideo {
                video_id: video_id.to_string(),
                reason: format!("duration {} is not a positive number of seconds", video.duration),
            });
        }

        let _guard = self.start_lock.lock().await;
        if let Some(existing) = self.storage.find_active_job(video_id).await? {
            return Err(JobError::AlreadyProcessing {
                video_id: video_id.to_string(),
                job_id: existing.id,
            });
        }

        let job = ProcessingJob::new(video_id, config);
        self.storage.save_job(&job).await?;
        self.submit(&job).await?;
        info!(job_id = %job.id, video_id, "Created processing job");
        Ok(job.id)
    }

    async fn submit(&self, job: &ProcessingJob) -> Result<(), JobError> {
        self.active
            .lock()
            .await
            .insert(job.id.clone(), ActiveJob::default());
        if let Err(e) = self.queue.enqueue(job.id.clone()) {
            self.active.lock().await.remove(&job.id);
            let mut job = job.clone();
            job.mark_error("The job queue is shut down.");
            self.persist(&job).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn get_status(&self, job_id: &str) -> Result<ProcessingJob, JobError> {
        self.storage
            .load_job(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    /// Requests cancellation. A queued job is cancelled at once; a running
    /// one stops at its next stage boundary.
    pub async fn cancel(&self, job_id: &str) -> Result<ProcessingJob, JobError> {
        let mut active = self.active.lock().await;
        let mut job = self.get_status(job_id).await?;
        let refuse = |job: &ProcessingJob| JobError::InvalidState {
            job_id: job.id.clone(),
            action: "cancel",
            status: job.status,
        };
        if job.is_terminal() {
            return Err(refuse(&job));
        }

        match active.get(job_id).map(|entry| (entry.running, entry.finishing)) {
            Some((_, true)) => Err(refuse(&job)),
            Some((true, _)) => {
                if let Some(entry) = active.get(job_id) {
                    entry.cancel.cancel();
                }
                info!(job_id, status = %job.status, "Cancellation requested");
                Ok(job)
            }
            _ => {
                // queued, or left over from an earlier process
                if let Some(entry) = active.remove(job_id) {
                    entry.cancel.cancel();
                }
                drop(active);
                job.mark_cancelled();
                self.persist(&job).await;
                self.broadcaster.cancelled(&job);
                self.notify(&job, &[]).await;
                info!(job_id, "Cancelled job before it started");
                Ok(job)
            }
        }
    }

    /// Starts a new attempt of a failed job from the first stage.
    pub async fn restart(&self, job_id: &str) -> Result<ProcessingJob, JobError> {
        let _guard = self.start_lock.lock().await;
        let mut job = self.get_status(job_id).await?;
        if job.status != JobStatus::Error {
            return Err(JobError::InvalidState {
                job_id: job.id,
                action: "restart",
                status: job.status,
            });
        }
        if let Some(existing) = self.storage.find_active_job(&job.video_id).await? {
            return Err(JobError::AlreadyProcessing {
                video_id: job.video_id,
                job_id: existing.id,
            });
        }

        job.reset_for_restart();
        self.storage.save_job(&job).await?;
        self.submit(&job).await?;
        info!(job_id, attempt = job.attempt, "Restarting job");
        Ok(job)
    }

    pub async fn estimate(&self, video_id: &str) -> Result<ProcessingEstimate, JobError> {
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or_else(|| JobError::VideoNotFound(video_id.to_string()))?;
        Ok(self
            .throughput
            .estimate(video_id, video.duration, self.models.preferred_device()))
    }

    pub async fn list_jobs(&self, pagination: &Pagination) -> Result<Vec<ProcessingJob>, JobError> {
        Ok(self.storage.list_jobs(pagination).await?)
    }

    pub async fn active_jobs(&self) -> Result<Vec<ProcessingJob>, JobError> {
        Ok(self.storage.list_active_jobs().await?)
    }

    pub async fn get_chapters(&self, video_id: &str) -> Result<Vec<Chapter>, JobError> {
        Ok(self.storage.load_chapters(video_id).await?)
    }

    pub fn subscribe(&self, job_id: &str) -> JobSubscription {
        self.broadcaster.subscribe(job_id)
    }

    pub async fn next_job(&self) -> Option<String> {
        self.queue.dequeue().await
    }

    pub fn close_queue(&self) {
        self.queue.close();
    }

    /// Marks jobs left active by a previous process as failed so they can
    /// be restarted.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let active = self.active.lock().await;
        let mut recovered = 0;
        for mut job in self.storage.list_active_jobs().await? {
            if active.contains_key(&job.id) {
                continue;
            }
            job.mark_error(INTERRUPTED_MESSAGE);
            self.storage.save_job(&job).await?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!("Marked {} interrupted jobs as failed", recovered);
        }
        Ok(recovered)
    }

    pub async fn cleanup_old_jobs(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        self.storage.cleanup_old(cutoff).await
    }

    async fn claim(&self, job_id: &str) -> Option<CancellationToken> {
        let mut active = self.active.lock().await;
        match active.get_mut(job_id) {
            Some(entry) if !entry.running && !entry.cancel.is_cancelled() => {
                entry.running = true;
                Some(entry.cancel.clone())
            }
            _ => None,
        }
    }

    /// Runs one queued job to a terminal state.
    pub async fn run_job(&self, job_id: &str) {
        let Some(cancel) = self.claim(job_id).await else {
            debug!(job_id, "Skipping job that is no longer queued");
            return;
        };

        match self.storage.load_job(job_id).await {
            Ok(Some(job)) if !job.is_terminal() => self.execute(job, &cancel).await,
            Ok(_) => debug!(job_id, "Job vanished or already finished"),
            Err(e) => error!(job_id, "Failed to load job: {}", e),
        }

        self.active.lock().await.remove(job_id);
    }

    /// Last resort when the task running a job died.
    pub async fn fail_after_panic(&self, job_id: &str) {
        self.active.lock().await.remove(job_id);
        match self.storage.load_job(job_id).await {
            Ok(Some(mut job)) if !job.is_terminal() => {
                job.mark_error(PANIC_MESSAGE);
                self.persist(&job).await;
                self.broadcaster.error(&job, PANIC_MESSAGE);
                self.notify(&job, &[]).await;
            }
            Ok(_) => {}
            Err(e) => error!(job_id, "Failed to load job after its task aborted: {}", e),
        }
    }

    async fn execute(&self, job: ProcessingJob, cancel: &CancellationToken) {
        let video = match self.videos.get_video(&job.video_id).await {
            Ok(Some(video)) => video,
            Ok(None) => {
                let message = format!("Video {} no longer exists.", job.video_id);
                self.fail_detached(job, &message).await;
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, "Video lookup failed: {:#}", e);
                self.fail_detached(job, PANIC_MESSAGE).await;
                return;
            }
        };

        let work_dir = self.options.work_dir.join(&job.id);
        let mut ctx = StageContext::new(
            job,
            video,
            work_dir.clone(),
            self.broadcaster.clone(),
            self.storage.clone(),
        );

        let outcome = match self.run_pipeline(&mut ctx, cancel).await {
            Ok(()) => self.complete(&mut ctx, cancel).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {}
            Err(PipelineError::Cancelled) => self.finish_cancelled(&mut ctx).await,
            Err(e) => self.finish_error(&mut ctx, e).await,
        }

        for processor in self.processors.values() {
            processor.cleanup(&ctx).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %ctx.job.id, "Failed to remove work dir {:?}: {}", work_dir, e);
            }
        }
    }

    async fn fail_detached(&self, mut job: ProcessingJob, message: &str) {
        job.mark_error(message);
        self.persist(&job).await;
        self.broadcaster.error(&job, message);
        self.notify(&job, &[]).await;
    }

    async fn run_pipeline(&self, ctx: &mut StageContext, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let weights = self.broadcaster.weights().clone();
        for stage in Stage::PIPELINE {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let processor = self
                .processors
                .get(&stage)
                .ok_or_else(|| PipelineError::fatal(format!("No processor is registered for {}.", stage)))?;

            ctx.set_stage(stage);
            ctx.job.enter_stage(stage);
            ctx.job.set_stage_progress(stage, 0.0, weights.overall(stage, 0.0));
            self.persist(&ctx.job).await;
            self.broadcaster.stage_boundary(&ctx.job, stage);
            info!(job_id = %ctx.job.id, stage = %stage, attempt = ctx.job.attempt, "Stage started");

            let started = Instant::now();
            match self.run_stage(processor.as_ref(), ctx, cancel).await {
                Ok(()) => {}
                Err(e) if stage == Stage::GeneratingChapters && e.allows_fallback() => {
                    self.apply_fallback(ctx, &e)?;
                }
                Err(e) => return Err(e),
            }
            let elapsed = started.elapsed().as_secs_f64();
            ctx.job.metadata.stage_seconds.insert(stage, elapsed);
            self.throughput.record(stage, elapsed, ctx.video.duration);

            ctx.job.set_stage_progress(stage, 100.0, weights.overall(stage, 1.0));
            self.persist(&ctx.job).await;
            self.broadcaster.stage_boundary(&ctx.job, stage);
            info!(job_id = %ctx.job.id, stage = %stage, elapsed, "Stage finished");
        }
        Ok(())
    }

    /// Runs one stage under its timeout, retrying transient failures.
    async fn run_stage(
        &self,
        processor: &dyn StageProcessor,
        ctx: &mut StageContext,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let stage = processor.stage();
        let limit = self.options.timeouts.for_stage(stage);
        let mut retries = 0;
        loop {
            *ctx.job.metadata.stage_attempts.entry(stage).or_insert(0) += 1;
            let result = match tokio::time::timeout(limit, processor.process(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(limit)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && self.options.retry.allows_retry(retries) => {
                    retries += 1;
                    warn!(job_id = %ctx.job.id, stage = %stage, retry = retries, "Stage failed, retrying: {}", e);
                    ctx.job.metadata.processing_errors.push(format!("{}: {}", stage, e));
                    let delay = self.options.retry.delay_for_retry(retries);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_fallback(&self, ctx: &mut StageContext, cause: &PipelineError) -> Result<(), PipelineError> {
        warn!(job_id = %ctx.job.id, "Chapter generation failed, using evenly spaced chapters: {}", cause);
        let config = &ctx.job.config;
        let candidates = fallback_candidates(ctx.video.duration, config.min_chapter_length, config.max_chapters);
        // fallback spacing may be below the minimum length, so nothing is merged
        let chapters = normalize_candidates(candidates, ctx.video.duration, 0.0, config.max_chapters)?;

        ctx.chapters = chapters;
        ctx.job.metadata.used_fallback = true;
        ctx.job
            .metadata
            .processing_errors
            .push(format!("{}: {}", Stage::GeneratingChapters, cause));
        Ok(())
    }

    async fn complete(&self, ctx: &mut StageContext, cancel: &CancellationToken) -> Result<(), PipelineError> {
        {
            let mut active = self.active.lock().await;
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if let Some(entry) = active.get_mut(&ctx.job.id) {
                entry.finishing = true;
            }
        }

        self.storage
            .save_chapters(&ctx.video.id, &ctx.chapters)
            .await
            .map_err(PipelineError::Unknown)?;
        ctx.job.mark_complete();
        self.persist(&ctx.job).await;
        self.broadcaster.complete(&ctx.job, ctx.chapters.clone());
        self.notify(&ctx.job, &ctx.chapters).await;
        info!(job_id = %ctx.job.id, chapters = ctx.chapters.len(), "Job complete");
        Ok(())
    }

    async fn finish_cancelled(&self, ctx: &mut StageContext) {
        ctx.chapters.clear();
        ctx.transcript = None;
        ctx.job.mark_cancelled();
        self.persist(&ctx.job).await;
        self.broadcaster.cancelled(&ctx.job);
        self.notify(&ctx.job, &[]).await;
        info!(job_id = %ctx.job.id, "Job cancelled");
    }

    async fn finish_error(&self, ctx: &mut StageContext, err: PipelineError) {
        match &err {
            PipelineError::Unknown(e) => {
                error!(job_id = %ctx.job.id, stage = %ctx.stage(), "Unexpected failure: {:#}", e)
            }
            e => warn!(job_id = %ctx.job.id, stage = %ctx.stage(), "Job failed: {}", e),
        }
        let message = err.user_message();
        ctx.chapters.clear();
        ctx.job.mark_error(message.clone());
        self.persist(&ctx.job).await;
        self.broadcaster.error(&ctx.job, message);
        self.notify(&ctx.job, &[]).await;
    }

    async fn persist(&self, job: &ProcessingJob) {
        if let Err(e) = self.storage.save_job(job).await {
            error!(job_id = %job.id, "Failed to save job: {:#}", e);
        }
    }

    async fn notify(&self, job: &ProcessingJob, chapters: &[Chapter]) {
        let Some(callback) = HttpCallback::for_job(&self.http, job) else {
            return;
        };
        let result = match job.status {
            JobStatus::Complete => callback.on_complete(job, chapters).await,
            JobStatus::Error => {
                let error = job.error_message.as_deref().unwrap_or_default();
                callback.on_error(job, error).await
            }
            JobStatus::Cancelled => callback.on_cancelled(job).await,
            _ => return,
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, "Failed to deliver callback: {:#}", e);
        }
    }
}
