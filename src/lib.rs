pub mod asr;
pub mod audio;
pub mod chapters;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod schedule;
pub mod storage;
pub mod transcript;
pub mod utils;
pub mod web;

use std::sync::Arc;

use config::Settings;
use model::ModelManager;
use schedule::JobManager;
use storage::SqliteVideoCatalog;

pub struct AppContext {
    pub job_manager: Arc<JobManager>,
    pub models: Arc<ModelManager>,
    pub videos: Arc<SqliteVideoCatalog>,
}

/// Loads `.env` into the process environment.
pub fn init_env() {
    dotenv::dotenv().ok();
}

pub fn create_data_dirs(settings: &Settings) {
    // make sure the data directories exist
    if let Some(db_path) = settings.database_url.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(dir) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| {
                eprintln!("Failed to create database directory: {}", e);
            });
        }
    }
    std::fs::create_dir_all(&settings.work_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create work directory: {}", e);
    });
}
