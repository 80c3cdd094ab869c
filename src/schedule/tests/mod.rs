use super::*;
use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};
use crate::config::{StageTimeouts, StageWeights};
use crate::error::{JobError, PipelineError};
use crate::llm::{ChapterGenerator, GenerationRequest};
use crate::model::{Device, DevicePreference, LoadedModel, ModelKind, ModelLoader, ModelManager};
use crate::storage::{InMemoryJobStorage, InMemoryVideoCatalog, VideoInfo};
use anyhow::Result;
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

const VIDEO_ID: &str = "video-1";
const VIDEO_SECONDS: f64 = 600.0;

const GOOD_ANSWER: &str = r#"{"chapters": [
    {"start_time": 0, "title": "Introduction", "confidence": 0.9},
    {"start_time": 150, "title": "Setting up", "confidence": 0.8},
    {"start_time": 300, "title": "The main build", "confidence": 0.85},
    {"start_time": 450, "title": "Wrapping up", "confidence": 0.7}
]}"#;

/// Writes 16 kHz audio in place of ffmpeg, one second unless told otherwise.
struct FakeExtract {
    silent: bool,
    fail_first: AtomicBool,
    hang: bool,
    seconds: f64,
}

impl FakeExtract {
    fn tone() -> Self {
        Self {
            silent: false,
            fail_first: AtomicBool::new(false),
            hang: false,
            seconds: 1.0,
        }
    }
}

#[async_trait]
impl StageProcessor for FakeExtract {
    fn stage(&self) -> Stage {
        Stage::ExtractingAudio
    }

    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::fatal("Source video is unreadable."));
        }
        std::fs::create_dir_all(&ctx.work_dir)?;
        let path = ctx.work_dir.join("audio.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).map_err(|e| PipelineError::fatal(e.to_string()))?;
        for i in 0..(16_000.0 * self.seconds) as usize {
            let sample = if self.silent {
                0
            } else {
                ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16_000.0).sin() * 12_000.0) as i16
            };
            writer.write_sample(sample).map_err(|e| PipelineError::fatal(e.to_string()))?;
        }
        writer.finalize().map_err(|e| PipelineError::fatal(e.to_string()))?;
        ctx.audio_path = Some(path);
        ctx.report(1.0).await;
        Ok(())
    }
}

/// Splits the video into evenly spaced segments, ten one-minute ones by
/// default. With a gate it signals `started` and waits to be released
/// before answering. Records the length of every chunk it receives.
struct FakeAsr {
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    segments: usize,
    filler: &'static str,
    received: Arc<StdMutex<Vec<usize>>>,
}

impl FakeAsr {
    fn plain() -> Self {
        Self {
            gate: None,
            segments: 10,
            filler: "",
            received: Arc::default(),
        }
    }

    fn gated(started: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((started, release)),
            ..Self::plain()
        }
    }

    fn text(&self, i: usize) -> String {
        if self.filler.is_empty() {
            format!("Segment number {} of the talk.", i + 1)
        } else {
            format!("Part {:02} {}", i + 1, self.filler)
        }
    }
}

#[async_trait]
impl AsrEngine for FakeAsr {
    async fn transcribe(&self, audio: Vec<f32>, _params: AsrParams) -> Result<TranscribeResult, PipelineError> {
        self.received.lock().unwrap().push(audio.len());
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        let step = VIDEO_SECONDS / self.segments as f64;
        let segments = (0..self.segments)
            .map(|i| TranscribeSegment {
                text: self.text(i),
                start: i as f64 * step,
                end: (i + 1) as f64 * step,
                words: Vec::new(),
            })
            .collect();
        Ok(TranscribeResult {
            segments,
            full_text: String::new(),
            language: Some("en".to_string()),
        })
    }
}

/// Answers from a script; the last entry repeats.
struct FakeGenerator {
    answers: StdMutex<VecDeque<Result<String, PipelineError>>>,
    last: String,
    context: usize,
}

impl FakeGenerator {
    fn always(answer: &str) -> Self {
        Self::after(Vec::new(), answer)
    }

    fn after(first: Vec<Result<String, PipelineError>>, then: &str) -> Self {
        Self {
            answers: StdMutex::new(first.into()),
            last: then.to_string(),
            context: 8192,
        }
    }
}

#[async_trait]
impl ChapterGenerator for FakeGenerator {
    fn context_window(&self) -> usize {
        self.context
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, PipelineError> {
        let next = self.answers.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.last.clone()))
    }
}

#[derive(Clone, Copy)]
enum LoadFailure {
    Never,
    /// Out of memory on CUDA or Metal, fine on the CPU.
    Accelerated,
    Always,
}

struct FakeLoader {
    kind: ModelKind,
    model: LoadedModel,
    failure: LoadFailure,
}

impl FakeLoader {
    fn transcriber(asr: FakeAsr, failure: LoadFailure) -> Arc<Self> {
        Arc::new(Self {
            kind: ModelKind::Transcription,
            model: LoadedModel::Transcriber(Arc::new(asr)),
            failure,
        })
    }

    fn generator(generator: FakeGenerator, failure: LoadFailure) -> Arc<Self> {
        Arc::new(Self {
            kind: ModelKind::ChapterGeneration,
            model: LoadedModel::Generator(Arc::new(generator)),
            failure,
        })
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    async fn load(&self, device: Device) -> Result<LoadedModel, PipelineError> {
        match self.failure {
            LoadFailure::Always => Err(PipelineError::model_load(self.kind, "weights are missing")),
            LoadFailure::Accelerated if device.is_accelerated() => {
                Err(PipelineError::model_load(self.kind, "out of device memory"))
            }
            _ => Ok(self.model.clone()),
        }
    }
}

struct Harness {
    manager: Arc<JobManager>,
    storage: Arc<InMemoryJobStorage>,
    _work_dir: TempDir,
}

/// Everything the pipeline runs with, before the job manager is built.
struct Fixture {
    extract: FakeExtract,
    models: ModelManager,
    chunk_seconds: f64,
    workers: usize,
}

impl Fixture {
    fn new(extract: FakeExtract, asr: FakeAsr, generator: FakeGenerator, workers: usize) -> Self {
        Self {
            extract,
            models: models_with(
                DevicePreference::Cpu,
                FakeLoader::transcriber(asr, LoadFailure::Never),
                FakeLoader::generator(generator, LoadFailure::Never),
            ),
            chunk_seconds: 300.0,
            workers,
        }
    }
}

fn models_with(
    preference: DevicePreference,
    transcription: Arc<FakeLoader>,
    generation: Arc<FakeLoader>,
) -> ModelManager {
    let mut models = ModelManager::new(preference);
    models.register_loader(transcription);
    models.register_loader(generation);
    models
}

async fn setup(
    extract: FakeExtract,
    asr: FakeAsr,
    generator: FakeGenerator,
    options: impl FnOnce(&mut JobManagerOptions),
    workers: usize,
) -> Result<Harness> {
    launch(Fixture::new(extract, asr, generator, workers), options).await
}

async fn launch(fixture: Fixture, options: impl FnOnce(&mut JobManagerOptions)) -> Result<Harness> {
    let work_dir = TempDir::new()?;
    let storage = Arc::new(InMemoryJobStorage::new());
    let videos = Arc::new(InMemoryVideoCatalog::new());
    videos.insert(VideoInfo {
        id: VIDEO_ID.to_string(),
        duration: VIDEO_SECONDS,
        source_path: PathBuf::from("/media/talk.mp4"),
    });
    let models = Arc::new(fixture.models);

    let broadcaster = Arc::new(ProgressBroadcaster::new(StageWeights::default(), Duration::ZERO));
    let mut job_options = JobManagerOptions {
        retry: RetryPolicy::immediate(2),
        timeouts: StageTimeouts::uniform(Duration::from_secs(10)),
        work_dir: work_dir.path().to_path_buf(),
    };
    options(&mut job_options);

    let job_manager = JobManager::new(storage.clone(), videos, models.clone(), broadcaster, job_options);
    let (manager, scheduler) = create_scheduler(
        job_manager,
        vec![
            Box::new(fixture.extract),
            Box::new(TranscribeProcessor::new(models.clone(), fixture.chunk_seconds)),
            Box::new(GenerateChaptersProcessor::new(models)),
            Box::new(FinalizeProcessor),
        ],
    );
    scheduler.spawn_workers(fixture.workers).await;

    Ok(Harness {
        manager,
        storage,
        _work_dir: work_dir,
    })
}

async fn default_setup(generator: FakeGenerator) -> Result<Harness> {
    setup(FakeExtract::tone(), FakeAsr::plain(), generator, |_| {}, 1).await
}

async fn wait_for_terminal(manager: &JobManager, job_id: &str) -> ProcessingJob {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = manager.get_status(job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state")
}

fn config(min_chapter_length: f64, max_chapters: usize) -> ProcessingConfig {
    ProcessingConfig {
        min_chapter_length,
        max_chapters,
        ..ProcessingConfig::default()
    }
}

#[tokio::test]
async fn test_job_runs_to_completion() -> Result<()> {
    let h = default_setup(FakeGenerator::always(GOOD_ANSWER)).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.progress, 100.0);
    assert!(job.end_time.is_some());
    assert!(job.error_message.is_none());
    assert!(!job.metadata.used_fallback);
    assert_eq!(job.metadata.transcript_utterances, Some(10));
    assert_eq!(job.metadata.transcript_language.as_deref(), Some("en"));
    assert_eq!(job.metadata.chapters_generated, Some(4));
    assert_eq!(job.metadata.devices.get(&ModelKind::Transcription), Some(&Device::Cpu));

    let chapters = h.manager.get_chapters(VIDEO_ID).await?;
    assert!((1..=5).contains(&chapters.len()));
    assert_eq!(chapters[0].start_time, 0.0);
    assert_eq!(chapters.last().unwrap().end_time, Some(VIDEO_SECONDS));
    for pair in chapters.windows(2) {
        assert!(pair[0].start_time < pair[1].start_time);
        assert_eq!(pair[0].end_time, Some(pair[1].start_time));
    }
    assert_eq!(h.storage.save_chapters_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_transcription_persists_nothing() -> Result<()> {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let asr = FakeAsr::gated(started.clone(), release.clone());
    let h = setup(FakeExtract::tone(), asr, FakeGenerator::always(GOOD_ANSWER), |_| {}, 1).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    started.notified().await;
    let snapshot = h.manager.cancel(&job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Transcribing);
    release.notify_one();

    let job = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(h.storage.save_chapters_calls(), 0);
    assert!(h.manager.get_chapters(VIDEO_ID).await?.is_empty());

    let again = h.manager.cancel(&job_id).await;
    assert!(matches!(again, Err(JobError::InvalidState { action: "cancel", .. })));
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_queued_is_immediate() -> Result<()> {
    let h = setup(
        FakeExtract::tone(),
        FakeAsr::plain(),
        FakeGenerator::always(GOOD_ANSWER),
        |_| {},
        0,
    )
    .await?;

    let job_id = h.manager.start(VIDEO_ID, ProcessingConfig::default()).await?;
    let job = h.manager.cancel(&job_id).await?;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(h.manager.get_status(&job_id).await?.status, JobStatus::Cancelled);

    // the video is free again
    assert!(h.manager.start(VIDEO_ID, ProcessingConfig::default()).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_unparseable_generation_falls_back() -> Result<()> {
    let h = default_setup(FakeGenerator::always("Sorry, I cannot help with that.")).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.metadata.used_fallback);

    let chapters = h.manager.get_chapters(VIDEO_ID).await?;
    let starts: Vec<f64> = chapters.iter().map(|c| c.start_time).collect();
    assert_eq!(starts, vec![0.0, 120.0, 240.0, 360.0, 480.0]);
    assert!(chapters.iter().all(|c| c.confidence == Some(0.0) && c.is_ai_generated));
    assert_eq!(chapters[4].end_time, Some(VIDEO_SECONDS));
    Ok(())
}

#[tokio::test]
async fn test_fallback_is_deterministic() -> Result<()> {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let h = default_setup(FakeGenerator::always("no chapters here")).await?;
        let job_id = h.manager.start(VIDEO_ID, config(45.0, 8)).await?;
        wait_for_terminal(&h.manager, &job_id).await;
        runs.push(h.manager.get_chapters(VIDEO_ID).await?);
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_silent_audio_completes_with_fallback() -> Result<()> {
    let extract = FakeExtract {
        silent: true,
        ..FakeExtract::tone()
    };
    let h = setup(extract, FakeAsr::plain(), FakeGenerator::always(GOOD_ANSWER), |_| {}, 1).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.metadata.transcript_utterances, Some(0));
    assert!(job.metadata.used_fallback);
    Ok(())
}

#[tokio::test]
async fn test_transient_generation_failure_is_retried() -> Result<()> {
    let generator = FakeGenerator::after(vec![Err(PipelineError::transient("connection reset"))], GOOD_ANSWER);
    let h = default_setup(generator).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert!(!job.metadata.used_fallback);
    assert_eq!(job.metadata.stage_attempts.get(&Stage::GeneratingChapters), Some(&2));
    assert_eq!(job.metadata.processing_errors.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_second_start_is_rejected() -> Result<()> {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let asr = FakeAsr::gated(started.clone(), release.clone());
    let h = setup(FakeExtract::tone(), asr, FakeGenerator::always(GOOD_ANSWER), |_| {}, 1).await?;

    let first = h.manager.start(VIDEO_ID, ProcessingConfig::default()).await?;
    let second = h.manager.start(VIDEO_ID, ProcessingConfig::default()).await;
    match second {
        Err(JobError::AlreadyProcessing { job_id, .. }) => assert_eq!(job_id, first),
        other => panic!("expected AlreadyProcessing, got {:?}", other),
    }
    assert_eq!(h.manager.list_jobs(&crate::web::Pagination::default()).await?.len(), 1);

    started.notified().await;
    release.notify_one();
    wait_for_terminal(&h.manager, &first).await;
    Ok(())
}

#[tokio::test]
async fn test_start_rejects_bad_input() -> Result<()> {
    let h = default_setup(FakeGenerator::always(GOOD_ANSWER)).await?;

    let missing = h.manager.start("video-404", ProcessingConfig::default()).await;
    assert!(matches!(missing, Err(JobError::VideoNotFound(_))));

    let invalid = h.manager.start(VIDEO_ID, config(0.0, 5)).await;
    assert!(matches!(invalid, Err(JobError::InvalidConfig(_))));
    Ok(())
}

#[tokio::test]
async fn test_restart_after_error() -> Result<()> {
    let extract = FakeExtract {
        fail_first: AtomicBool::new(true),
        ..FakeExtract::tone()
    };
    let h = setup(extract, FakeAsr::plain(), FakeGenerator::always(GOOD_ANSWER), |_| {}, 1).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let failed = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.error_message.as_deref(), Some("Source video is unreadable."));

    let restarted = h.manager.restart(&job_id).await?;
    assert_eq!(restarted.id, job_id);
    assert_eq!(restarted.attempt, 2);
    assert_eq!(restarted.progress, 0.0);
    assert!(restarted.error_message.is_none());
    assert!(restarted.stage_progress.values().all(|p| *p == 0.0));

    let done = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(done.status, JobStatus::Complete);
    assert_eq!(done.metadata.processing_errors.len(), 1);

    let again = h.manager.restart(&job_id).await;
    assert!(matches!(again, Err(JobError::InvalidState { action: "restart", .. })));
    Ok(())
}

#[tokio::test]
async fn test_stage_timeout_escalates_to_error() -> Result<()> {
    let extract = FakeExtract {
        hang: true,
        ..FakeExtract::tone()
    };
    let h = setup(
        extract,
        FakeAsr::plain(),
        FakeGenerator::always(GOOD_ANSWER),
        |options| {
            options.timeouts = StageTimeouts::uniform(Duration::from_millis(50));
            options.retry = RetryPolicy::immediate(1);
        },
        1,
    )
    .await?;

    let job_id = h.manager.start(VIDEO_ID, ProcessingConfig::default()).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.metadata.stage_attempts.get(&Stage::ExtractingAudio), Some(&2));
    assert!(job.error_message.unwrap().contains("did not finish"));
    Ok(())
}

#[tokio::test]
async fn test_progress_events_are_monotonic() -> Result<()> {
    let h = default_setup(FakeGenerator::always(GOOD_ANSWER)).await?;
    let mut rx = h.manager.broadcaster().subscribe_all();

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let mut progress = Vec::new();
    let mut stages = Vec::new();
    let last = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await??;
        match event {
            JobEvent::JobProgress { progress: p, stage, .. } => {
                progress.push(p);
                if stages.last() != Some(&stage) {
                    stages.push(stage);
                }
            }
            other => break other,
        }
    };

    assert_eq!(last.name(), "job_complete");
    assert_eq!(last.job_id(), job_id);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.last().copied().unwrap_or(0.0) > 99.99);
    assert_eq!(stages, Stage::PIPELINE.to_vec());
    Ok(())
}

#[tokio::test]
async fn test_estimate_uses_duration() -> Result<()> {
    let h = default_setup(FakeGenerator::always(GOOD_ANSWER)).await?;
    let estimate = h.manager.estimate(VIDEO_ID).await?;
    assert_eq!(estimate.device, Device::Cpu);
    assert_eq!(estimate.per_stage_seconds.len(), 4);
    assert!(estimate.total_seconds > 0.0);
    assert!(matches!(h.manager.estimate("video-404").await, Err(JobError::VideoNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_recover_interrupted_jobs() -> Result<()> {
    let h = setup(
        FakeExtract::tone(),
        FakeAsr::plain(),
        FakeGenerator::always(GOOD_ANSWER),
        |_| {},
        1,
    )
    .await?;

    let mut stale = ProcessingJob::new(VIDEO_ID, ProcessingConfig::default());
    stale.enter_stage(Stage::Transcribing);
    h.storage.save_job(&stale).await?;

    assert_eq!(h.manager.recover_interrupted().await?, 1);
    let job = h.manager.get_status(&stale.id).await?;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("service restart"));

    h.manager.restart(&stale.id).await?;
    let done = wait_for_terminal(&h.manager, &stale.id).await;
    assert_eq!(done.status, JobStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn test_model_load_failure_fails_job_by_default() -> Result<()> {
    let fixture = Fixture {
        models: models_with(
            DevicePreference::Cuda,
            FakeLoader::transcriber(FakeAsr::plain(), LoadFailure::Accelerated),
            FakeLoader::generator(FakeGenerator::always(GOOD_ANSWER), LoadFailure::Accelerated),
        ),
        ..Fixture::new(FakeExtract::tone(), FakeAsr::plain(), FakeGenerator::always(GOOD_ANSWER), 1)
    };
    let h = launch(fixture, |_| {}).await?;

    assert!(!ProcessingConfig::default().allow_cpu_fallback);
    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.error_message.as_deref(),
        Some("The transcription model could not be loaded.")
    );
    assert_eq!(job.metadata.stage_attempts.get(&Stage::Transcribing), Some(&1));
    assert!(job.metadata.devices.is_empty());
    assert_eq!(h.storage.save_chapters_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_opting_into_cpu_fallback_completes_on_cpu() -> Result<()> {
    let fixture = Fixture {
        models: models_with(
            DevicePreference::Cuda,
            FakeLoader::transcriber(FakeAsr::plain(), LoadFailure::Accelerated),
            FakeLoader::generator(FakeGenerator::always(GOOD_ANSWER), LoadFailure::Accelerated),
        ),
        ..Fixture::new(FakeExtract::tone(), FakeAsr::plain(), FakeGenerator::always(GOOD_ANSWER), 1)
    };
    let h = launch(fixture, |_| {}).await?;

    let cfg = ProcessingConfig {
        allow_cpu_fallback: true,
        ..config(30.0, 5)
    };
    let job_id = h.manager.start(VIDEO_ID, cfg).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert!(!job.metadata.used_fallback);
    assert_eq!(job.metadata.devices.get(&ModelKind::Transcription), Some(&Device::Cpu));
    assert_eq!(job.metadata.devices.get(&ModelKind::ChapterGeneration), Some(&Device::Cpu));
    assert_eq!(h.storage.save_chapters_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_generation_model_load_failure_skips_fallback() -> Result<()> {
    let fixture = Fixture {
        models: models_with(
            DevicePreference::Cpu,
            FakeLoader::transcriber(FakeAsr::plain(), LoadFailure::Never),
            FakeLoader::generator(FakeGenerator::always(GOOD_ANSWER), LoadFailure::Always),
        ),
        ..Fixture::new(FakeExtract::tone(), FakeAsr::plain(), FakeGenerator::always(GOOD_ANSWER), 1)
    };
    let h = launch(fixture, |_| {}).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.error_message.as_deref(),
        Some("The chapter generation model could not be loaded.")
    );
    assert!(!job.metadata.used_fallback);
    assert_eq!(job.metadata.transcript_utterances, Some(10));
    assert_eq!(h.storage.save_chapters_calls(), 0);
    assert!(h.manager.get_chapters(VIDEO_ID).await?.is_empty());
    Ok(())
}

fn window_answer(chapters: &[(u32, &str)]) -> Result<String, PipelineError> {
    let entries: Vec<String> = chapters
        .iter()
        .map(|(start, title)| format!(r#"{{"start_time": {}, "title": "{}", "confidence": 0.8}}"#, start, title))
        .collect();
    Ok(format!(r#"{{"chapters": [{}]}}"#, entries.join(", ")))
}

#[tokio::test]
async fn test_long_transcript_is_split_and_merged() -> Result<()> {
    // forty 15 s utterances of 25 tokens each: windows of ten that share
    // their last utterance with the next window
    let asr = FakeAsr {
        segments: 40,
        filler: "we keep talking we keep talking we keep talking we keep talking we keep talking ",
        ..FakeAsr::plain()
    };
    let mut generator = FakeGenerator::after(
        vec![
            window_answer(&[(0, "Opening"), (135, "Tooling")]),
            window_answer(&[(135, "Tooling"), (270, "Testing")]),
            window_answer(&[(272, "Testing again"), (330, "Profiling")]),
            window_answer(&[(405, "Deployment")]),
            window_answer(&[(540, "Wrap-up")]),
        ],
        "no more chapters",
    );
    generator.context = crate::llm::RESERVED_TOKENS + 256;
    let h = setup(FakeExtract::tone(), asr, generator, |_| {}, 1).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 10)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert!(!job.metadata.used_fallback);
    assert_eq!(job.metadata.transcript_utterances, Some(40));
    assert_eq!(job.metadata.generation_windows, Some(5));
    assert!(job.metadata.processing_errors.is_empty());

    let chapters = h.manager.get_chapters(VIDEO_ID).await?;
    let starts: Vec<f64> = chapters.iter().map(|c| c.start_time).collect();
    assert_eq!(starts, vec![0.0, 135.0, 270.0, 330.0, 405.0, 540.0]);
    let titles: Vec<&str> = chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Opening", "Tooling", "Testing", "Profiling", "Deployment", "Wrap-up"]
    );
    assert_eq!(chapters.last().unwrap().end_time, Some(VIDEO_SECONDS));
    Ok(())
}

#[tokio::test]
async fn test_audio_is_transcribed_in_streamed_chunks() -> Result<()> {
    let asr = FakeAsr::plain();
    let received = asr.received.clone();
    let fixture = Fixture {
        chunk_seconds: 1.0,
        ..Fixture::new(
            FakeExtract {
                seconds: 2.5,
                ..FakeExtract::tone()
            },
            asr,
            FakeGenerator::always(GOOD_ANSWER),
            1,
        )
    };
    let h = launch(fixture, |_| {}).await?;

    let job_id = h.manager.start(VIDEO_ID, config(30.0, 5)).await?;
    let job = wait_for_terminal(&h.manager, &job_id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(*received.lock().unwrap(), vec![16_000, 16_000, 8_000]);
    assert_eq!(job.metadata.transcript_utterances, Some(30));
    Ok(())
}

#[tokio::test]
async fn test_closed_queue_leaves_backlog_pending() -> Result<()> {
    let h = setup(
        FakeExtract::tone(),
        FakeAsr::plain(),
        FakeGenerator::always(GOOD_ANSWER),
        |_| {},
        0,
    )
    .await?;

    let job_id = h.manager.start(VIDEO_ID, ProcessingConfig::default()).await?;
    h.manager.close_queue();
    assert_eq!(h.manager.next_job().await, None);

    let job = h.manager.get_status(&job_id).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(h.storage.save_chapters_calls(), 0);
    Ok(())
}
