use std::sync::Arc;

pub mod callback;
pub mod estimate;
pub mod processors;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod types;
#[cfg(test)]
mod tests;

pub use types::{
    JobMetadata, JobStatus, ProcessingConfig, ProcessingEstimate, ProcessingJob, Stage,
};

pub use crate::storage::JobStorage;

pub use processors::{
    ExtractAudioProcessor, FinalizeProcessor, GenerateChaptersProcessor, StageContext,
    StageProcessor, TranscribeProcessor,
};
pub use progress::{JobEvent, JobSubscription, ProgressBroadcaster};
pub use retry::RetryPolicy;
pub use scheduler::{JobManager, JobManagerOptions, JobScheduler};

/// Builds a job manager with the given stage processors and wraps it in a
/// scheduler.
pub fn create_scheduler(
    mut job_manager: JobManager,
    processors: Vec<Box<dyn StageProcessor>>,
) -> (Arc<JobManager>, JobScheduler) {
    for processor in processors {
        job_manager.register_processor(processor);
    }
    let job_manager = Arc::new(job_manager);
    let scheduler = JobScheduler::new(job_manager.clone());
    (job_manager, scheduler)
}
