use std::sync::Arc;

use tracing::{error, info};

use super::JobManager;

pub struct JobWorker {
    // worker number, for logs
    id: usize,
    job_manager: Arc<JobManager>,
}

impl JobWorker {
    pub fn new(id: usize, job_manager: Arc<JobManager>) -> Self {
        Self { id, job_manager }
    }

    /// Runs queued jobs one at a time until the queue is closed.
    pub async fn run(&self) {
        info!(worker = self.id, "Worker started");
        while let Some(job_id) = self.job_manager.next_job().await {
            self.process(job_id).await;
        }
        info!(worker = self.id, "Job queue closed, worker exiting");
    }

    async fn process(&self, job_id: String) {
        info!(worker = self.id, job_id = %job_id, "Picked up job");

        // run in its own task so a panic fails the job instead of the worker
        let manager = self.job_manager.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move { manager.run_job(&id).await });

        if let Err(e) = handle.await {
            error!(worker = self.id, job_id = %job_id, "Job task aborted: {}", e);
            self.job_manager.fail_after_panic(&job_id).await;
        }
    }
}
