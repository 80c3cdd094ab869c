#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use chapter_rs::{
    asr::RemoteAsrLoader,
    config::Settings,
    llm::OpenAiLoader,
    model::ModelManager,
    schedule::{
        create_scheduler, ExtractAudioProcessor, FinalizeProcessor, GenerateChaptersProcessor,
        JobManager, JobManagerOptions, ProgressBroadcaster, TranscribeProcessor,
    },
    storage::{SqliteJobStorage, SqliteVideoCatalog},
    utils::logger,
    AppContext,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    chapter_rs::init_env();
    let settings = Settings::from_env()?;

    let _guard = logger::init(settings.log_dir.clone())?;
    chapter_rs::create_data_dirs(&settings);

    info!("Starting chapter service ({})...", env!("GIT_HASH"));

    info!("Initializing Storage...");
    let pool = SqlitePoolOptions::new().connect(&settings.database_url).await?;
    let storage = Arc::new(SqliteJobStorage::from_pool(pool.clone()).await?);
    let videos = Arc::new(SqliteVideoCatalog::from_pool(pool).await?);

    info!("Initializing Model Manager...");
    let mut models = ModelManager::new(settings.device_preference);
    models.register_loader(transcription_loader(&settings));
    models.register_loader(Arc::new(OpenAiLoader::new(
        settings.llm_url.clone(),
        settings.llm_model.clone(),
        settings.llm_api_key.clone(),
        settings.llm_context_tokens,
    )));
    let models = Arc::new(models);

    info!("Initializing Job Manager...");
    let broadcaster = Arc::new(ProgressBroadcaster::new(
        settings.stage_weights.clone(),
        settings.progress_throttle,
    ));
    let job_manager = JobManager::new(
        storage,
        videos.clone(),
        models.clone(),
        broadcaster,
        JobManagerOptions::from_settings(&settings),
    );
    let (job_manager, scheduler) = create_scheduler(
        job_manager,
        vec![
            Box::new(ExtractAudioProcessor::new()),
            Box::new(TranscribeProcessor::new(models.clone(), settings.chunk_seconds)),
            Box::new(GenerateChaptersProcessor::new(models.clone())),
            Box::new(FinalizeProcessor),
        ],
    );
    job_manager.recover_interrupted().await?;

    let ctx = Arc::new(AppContext {
        job_manager: job_manager.clone(),
        models,
        videos,
    });

    info!("Initializing Scheduler...");
    scheduler.spawn_workers(settings.worker_pool_size).await;
    let scheduler = Arc::new(scheduler);
    let runner = scheduler.clone();
    let retention_days = settings.retention_days;
    let cleanup_interval = settings.cleanup_interval;
    let scheduler_task = tokio::spawn(async move {
        if let Err(e) = runner.run(retention_days, cleanup_interval).await {
            error!("Scheduler error: {}", e);
        }
    });

    info!("Starting HTTP server at http://{}", settings.bind_addr);
    let served = chapter_rs::web::start_server(ctx, settings.bind_addr).await;

    info!("Shutting down...");
    scheduler.shutdown();
    let _ = scheduler_task.await;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}

#[cfg(feature = "whisper")]
fn transcription_loader(settings: &Settings) -> Arc<dyn chapter_rs::model::ModelLoader> {
    use chapter_rs::asr::whisper::WhisperLoader;

    match &settings.whisper_model_path {
        Some(path) => {
            info!("Using local Whisper model at {}", path.display());
            Arc::new(WhisperLoader::new(path.clone()))
        }
        None => remote_asr_loader(settings),
    }
}

#[cfg(not(feature = "whisper"))]
fn transcription_loader(settings: &Settings) -> Arc<dyn chapter_rs::model::ModelLoader> {
    remote_asr_loader(settings)
}

fn remote_asr_loader(settings: &Settings) -> Arc<dyn chapter_rs::model::ModelLoader> {
    info!("Using remote transcription at {}", settings.asr_url);
    Arc::new(RemoteAsrLoader::new(
        settings.asr_url.clone(),
        settings.asr_model.clone(),
        settings.asr_api_key.clone(),
    ))
}
