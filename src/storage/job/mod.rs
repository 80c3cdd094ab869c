use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chapters::Chapter;
use crate::schedule::types::ProcessingJob;
use crate::web::Pagination;

pub mod memory;
pub mod sqlite;

/// Persistence for job records and the chapters of finished videos.
#[async_trait]
pub trait JobStorage: Send + Sync + 'static {
    /// Inserts or replaces the job record.
    async fn save_job(&self, job: &ProcessingJob) -> Result<()>;
    async fn load_job(&self, job_id: &str) -> Result<Option<ProcessingJob>>;
    /// Most recent non-terminal job for `video_id`.
    async fn find_active_job(&self, video_id: &str) -> Result<Option<ProcessingJob>>;
    /// Newest first.
    async fn list_jobs(&self, pagination: &Pagination) -> Result<Vec<ProcessingJob>>;
    async fn list_active_jobs(&self) -> Result<Vec<ProcessingJob>>;
    /// Replaces every chapter stored for `video_id`.
    async fn save_chapters(&self, video_id: &str, chapters: &[Chapter]) -> Result<()>;
    async fn load_chapters(&self, video_id: &str) -> Result<Vec<Chapter>>;
    /// Deletes terminal jobs last updated before `before`.
    async fn cleanup_old(&self, before: DateTime<Utc>) -> Result<u64>;
}
