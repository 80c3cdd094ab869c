mod job_manager;
mod queue;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use job_manager::{JobManager, JobManagerOptions};
pub use queue::JobQueue;
use worker::JobWorker;

pub struct JobScheduler {
    job_manager: Arc<JobManager>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(job_manager: Arc<JobManager>) -> Self {
        Self {
            job_manager,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub async fn spawn_worker(&self) {
        let mut workers = self.workers.lock().await;
        let worker = JobWorker::new(workers.len() + 1, self.job_manager.clone());
        workers.push(tokio::spawn(async move {
            worker.run().await;
        }));
    }

    /// Starts `count` workers; at most `count` jobs run at once.
    pub async fn spawn_workers(&self, count: usize) {
        for _ in 0..count {
            self.spawn_worker().await;
        }
        info!("Started {} job workers", count);
    }

    /// Runs periodic cleanup of old jobs and waits for the workers, which
    /// exit once the queue is closed.
    pub async fn run(&self, retention_days: i64, cleanup_interval: Duration) -> Result<()> {
        let jm = self.job_manager.clone();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                match jm.cleanup_old_jobs(retention_days).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Removed {} finished jobs older than {} days", removed, retention_days),
                    Err(e) => error!("Error cleaning up old jobs: {}", e),
                }
            }
        });

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.await?;
        }
        cleanup.abort();

        Ok(())
    }

    pub fn shutdown(&self) {
        self.job_manager.close_queue();
    }
}
