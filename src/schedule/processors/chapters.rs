use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{acquire_model, StageContext, StageProcessor};
use crate::chapters::{normalize_candidates, parse_chapter_response, validate_chapters, ChapterCandidate};
use crate::error::PipelineError;
use crate::llm::{build_request, WindowPrompt, RESERVED_TOKENS};
use crate::model::{ModelKind, ModelManager};
use crate::schedule::types::Stage;
use crate::transcript::split_windows;

/// Smallest transcript window, whatever the model's context size.
const MIN_WINDOW_TOKENS: usize = 256;

/// Asks the chapter generator for boundaries, window by window, and merges
/// the answers into one chapter list.
///
/// A window whose answer cannot be parsed is skipped; if no window yields
/// candidates the stage fails with a validation error and the job manager
/// decides what happens next.
pub struct GenerateChaptersProcessor {
    models: Arc<ModelManager>,
}

impl GenerateChaptersProcessor {
    pub fn new(models: Arc<ModelManager>) -> Self {
        Self { models }
    }
}

#[async_trait]
impl StageProcessor for GenerateChaptersProcessor {
    fn stage(&self) -> Stage {
        Stage::GeneratingChapters
    }

    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let transcript = match &ctx.transcript {
            Some(t) if !t.is_empty() => t.clone(),
            _ => return Err(PipelineError::validation("the transcript is empty")),
        };

        let handle = acquire_model(&self.models, ModelKind::ChapterGeneration, ctx).await?;
        let generator = handle.generator()?;

        let budget = generator
            .context_window()
            .saturating_sub(RESERVED_TOKENS)
            .max(MIN_WINDOW_TOKENS);
        let windows = split_windows(&transcript.utterances, budget, budget / 10);
        ctx.job.metadata.generation_windows = Some(windows.len());

        let mut candidates: Vec<ChapterCandidate> = Vec::new();
        for (i, range) in windows.iter().enumerate() {
            let text = transcript.render(range.clone());
            let prompt = WindowPrompt {
                transcript: &text,
                window_start: transcript.utterances[range.start].start,
                window_end: transcript.utterances[range.end - 1].end,
                index: i,
                count: windows.len(),
                video_duration: ctx.video.duration,
            };
            let request = build_request(&prompt, &ctx.job.config);

            let answer = generator.generate(&request).await?;
            match parse_chapter_response(&answer) {
                Ok(found) => candidates.extend(found),
                Err(e) => {
                    warn!(job_id = %ctx.job.id, window = i, "Skipping window: {}", e);
                    ctx.job
                        .metadata
                        .processing_errors
                        .push(format!("window {}: {}", i + 1, e));
                }
            }
            ctx.report((i + 1) as f64 / windows.len() as f64).await;
        }
        drop(handle);

        if candidates.is_empty() {
            return Err(PipelineError::validation("no window produced usable chapters"));
        }

        let config = &ctx.job.config;
        let chapters = normalize_candidates(
            candidates,
            ctx.video.duration,
            config.min_chapter_length,
            config.max_chapters,
        )?;
        validate_chapters(&chapters, ctx.video.duration)?;

        info!(job_id = %ctx.job.id, chapters = chapters.len(), windows = windows.len(), "Chapters generated");
        ctx.chapters = chapters;
        Ok(())
    }
}
