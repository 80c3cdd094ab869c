use async_trait::async_trait;

use super::{StageContext, StageProcessor};
use crate::chapters::finalize_chapters;
use crate::error::PipelineError;
use crate::schedule::types::Stage;

pub struct FinalizeProcessor;

#[async_trait]
impl StageProcessor for FinalizeProcessor {
    fn stage(&self) -> Stage {
        Stage::Finalizing
    }

    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let chapters = finalize_chapters(std::mem::take(&mut ctx.chapters), ctx.video.duration)?;

        let confidences: Vec<f64> = chapters.iter().filter_map(|c| c.confidence).collect();
        ctx.job.metadata.chapters_generated = Some(chapters.len());
        ctx.job.metadata.average_confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
        };

        ctx.chapters = chapters;
        ctx.report(1.0).await;
        Ok(())
    }
}
