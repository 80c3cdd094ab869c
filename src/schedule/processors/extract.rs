use async_trait::async_trait;
use tracing::{info, warn};

use super::{StageContext, StageProcessor};
use crate::audio;
use crate::error::PipelineError;
use crate::schedule::types::Stage;

const AUDIO_FILE: &str = "audio.wav";

/// Pulls the audio track out of the source video with ffmpeg.
#[derive(Default)]
pub struct ExtractAudioProcessor;

impl ExtractAudioProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageProcessor for ExtractAudioProcessor {
    fn stage(&self) -> Stage {
        Stage::ExtractingAudio
    }

    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let dest = ctx.work_dir.join(AUDIO_FILE);
        audio::extract_audio(&ctx.video.source_path, &dest).await?;
        info!(job_id = %ctx.job.id, path = ?dest, "Audio extracted");
        ctx.audio_path = Some(dest);
        ctx.report(1.0).await;
        Ok(())
    }

    async fn cleanup(&self, ctx: &StageContext) {
        if let Some(path) = &ctx.audio_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %ctx.job.id, "Failed to remove {:?}: {}", path, e);
                }
            }
        }
    }
}
