use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::chapters::Chapter;
use crate::config::StageWeights;
use crate::schedule::types::{ProcessingJob, Stage};

const CHANNEL_CAPACITY: usize = 1024;

/// Events published for observers of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobProgress {
        job_id: String,
        stage: Stage,
        progress: f64,
        stage_progress: f64,
    },
    JobComplete {
        job_id: String,
        chapters: Vec<Chapter>,
    },
    JobError {
        job_id: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobComplete { job_id, .. }
            | JobEvent::JobError { job_id, .. }
            | JobEvent::JobCancelled { job_id } => job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::JobProgress { .. } => "job_progress",
            JobEvent::JobComplete { .. } => "job_complete",
            JobEvent::JobError { .. } => "job_error",
            JobEvent::JobCancelled { .. } => "job_cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::JobProgress { .. })
    }
}

/// Publishes job events on a broadcast channel.
///
/// Intra-stage updates go through a per-job rate limiter; stage boundaries
/// and terminal events bypass it.
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<JobEvent>,
    weights: StageWeights,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl ProgressBroadcaster {
    pub fn new(weights: StageWeights, throttle: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let limiter = Quota::with_period(throttle)
            .map(|quota| RateLimiter::keyed(quota.allow_burst(NonZeroU32::MIN)));
        Self { tx, weights, limiter }
    }

    pub fn weights(&self) -> &StageWeights {
        &self.weights
    }

    fn publish(&self, event: JobEvent) {
        debug!(job_id = event.job_id(), event = event.name(), "publishing job event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    fn progress_event(job: &ProcessingJob, stage: Stage) -> JobEvent {
        JobEvent::JobProgress {
            job_id: job.id.clone(),
            stage,
            progress: job.progress,
            stage_progress: job.stage_progress.get(&stage).copied().unwrap_or(0.0),
        }
    }

    /// Always emits. Used when a stage begins and when it ends.
    pub fn stage_boundary(&self, job: &ProcessingJob, stage: Stage) {
        self.publish(Self::progress_event(job, stage));
    }

    /// Emits an intra-stage update unless one went out for this job within
    /// the throttle period. Returns whether it was emitted.
    pub fn report(&self, job: &ProcessingJob, stage: Stage) -> bool {
        if let Some(limiter) = &self.limiter {
            if limiter.check_key(&job.id).is_err() {
                return false;
            }
        }
        self.publish(Self::progress_event(job, stage));
        true
    }

    pub fn complete(&self, job: &ProcessingJob, chapters: Vec<Chapter>) {
        self.publish(JobEvent::JobComplete {
            job_id: job.id.clone(),
            chapters,
        });
        self.forget_idle();
    }

    pub fn error(&self, job: &ProcessingJob, error: impl Into<String>) {
        self.publish(JobEvent::JobError {
            job_id: job.id.clone(),
            error: error.into(),
        });
        self.forget_idle();
    }

    pub fn cancelled(&self, job: &ProcessingJob) {
        self.publish(JobEvent::JobCancelled {
            job_id: job.id.clone(),
        });
        self.forget_idle();
    }

    fn forget_idle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }

    /// Events for one job only.
    pub fn subscribe(&self, job_id: impl Into<String>) -> JobSubscription {
        JobSubscription {
            job_id: job_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

pub struct JobSubscription {
    job_id: String,
    rx: broadcast::Receiver<JobEvent>,
}

impl JobSubscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event for the subscribed job, or `None` once the broadcaster is
    /// gone. Lagged receivers skip ahead.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.job_id() == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(job_id = %self.job_id, skipped, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_inner(self) -> broadcast::Receiver<JobEvent> {
        self.rx
    }
}
