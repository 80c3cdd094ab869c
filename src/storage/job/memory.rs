use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::JobStorage;
use crate::chapters::Chapter;
use crate::schedule::types::ProcessingJob;
use crate::web::Pagination;

/// Process-local storage for tests and single-shot runs.
#[derive(Default)]
pub struct InMemoryJobStorage {
    jobs: RwLock<HashMap<String, ProcessingJob>>,
    chapters: RwLock<HashMap<String, Vec<Chapter>>>,
    save_chapters_calls: AtomicUsize,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory storage lock poisoned")
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times chapters were written, regardless of video.
    pub fn save_chapters_calls(&self) -> usize {
        self.save_chapters_calls.load(Ordering::SeqCst)
    }

    fn sorted_jobs(&self, filter: impl Fn(&ProcessingJob) -> bool) -> Result<Vec<ProcessingJob>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut list: Vec<ProcessingJob> = jobs.values().filter(|j| filter(j)).cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn save_job(&self, job: &ProcessingJob) -> Result<()> {
        self.jobs
            .write()
            .map_err(poisoned)?
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<ProcessingJob>> {
        Ok(self.jobs.read().map_err(poisoned)?.get(job_id).cloned())
    }

    async fn find_active_job(&self, video_id: &str) -> Result<Option<ProcessingJob>> {
        Ok(self
            .sorted_jobs(|j| j.video_id == video_id && !j.is_terminal())?
            .into_iter()
            .next())
    }

    async fn list_jobs(&self, pagination: &Pagination) -> Result<Vec<ProcessingJob>> {
        let pagination = pagination.check();
        Ok(self
            .sorted_jobs(|_| true)?
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect())
    }

    async fn list_active_jobs(&self) -> Result<Vec<ProcessingJob>> {
        let mut jobs = self.sorted_jobs(|j| !j.is_terminal())?;
        jobs.reverse();
        Ok(jobs)
    }

    async fn save_chapters(&self, video_id: &str, chapters: &[Chapter]) -> Result<()> {
        self.save_chapters_calls.fetch_add(1, Ordering::SeqCst);
        self.chapters
            .write()
            .map_err(poisoned)?
            .insert(video_id.to_string(), chapters.to_vec());
        Ok(())
    }

    async fn load_chapters(&self, video_id: &str) -> Result<Vec<Chapter>> {
        Ok(self
            .chapters
            .read()
            .map_err(poisoned)?
            .get(video_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cleanup_old(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let count = jobs.len();
        jobs.retain(|_, j| !(j.is_terminal() && j.updated_at < before));
        Ok((count - jobs.len()) as u64)
    }
}
