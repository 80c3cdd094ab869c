use std::sync::Arc;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::{acquire_model, StageContext, StageProcessor};
use crate::asr::AsrParams;
use crate::audio::{is_silent, AudioChunk, AudioChunks};
use crate::error::PipelineError;
use crate::model::{ModelKind, ModelManager};
use crate::schedule::types::Stage;
use crate::transcript::{utterances_from_segments, Transcript};

/// Runs speech-to-text over the extracted audio, chunk by chunk.
pub struct TranscribeProcessor {
    models: Arc<ModelManager>,
    chunk_seconds: f64,
}

impl TranscribeProcessor {
    pub fn new(models: Arc<ModelManager>, chunk_seconds: f64) -> Self {
        Self {
            models,
            chunk_seconds,
        }
    }

    fn record(ctx: &mut StageContext, transcript: Transcript) {
        ctx.job.metadata.transcript_utterances = Some(transcript.utterances.len());
        ctx.job.metadata.transcript_words = Some(transcript.word_count);
        ctx.job.metadata.transcript_language = transcript.language.clone();
        ctx.transcript = Some(transcript);
    }
}

#[async_trait]
impl StageProcessor for TranscribeProcessor {
    fn stage(&self) -> Stage {
        Stage::Transcribing
    }

    async fn process(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let path = ctx
            .audio_path
            .clone()
            .ok_or_else(|| PipelineError::fatal("No extracted audio is available for transcription."))?;
        let (mut chunks, decoder) = stream_chunks(path, self.chunk_seconds, ctx.job.config.denoise);

        let mut handle = None;
        let mut utterances = Vec::new();
        let mut language = ctx.job.config.language.clone();
        let mut total = 0;

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk
                .map_err(|e| PipelineError::fatal(format!("The extracted audio could not be decoded: {}", e)))?;
            total = chunk.total;

            if !is_silent(&chunk.samples) {
                // loaded on the first chunk with speech
                let current = match handle.take() {
                    Some(current) => current,
                    None => acquire_model(&self.models, ModelKind::Transcription, ctx).await?,
                };
                let mut params = AsrParams::new();
                params.set_language(ctx.job.config.language.clone());
                let result = current.transcriber()?.transcribe(chunk.samples, params).await;
                handle = Some(current);

                let result = result?;
                if language.is_none() {
                    language = result.language.clone();
                }
                utterances.extend(utterances_from_segments(&result.segments, chunk.offset));
            }
            ctx.report((chunk.index + 1) as f64 / chunk.total as f64).await;
        }
        drop(handle);
        decoder.await.map_err(|e| PipelineError::Unknown(e.into()))?;

        if utterances.is_empty() {
            info!(job_id = %ctx.job.id, "No speech found, transcript is empty");
        }
        ctx.report(1.0).await;
        info!(
            job_id = %ctx.job.id,
            utterances = utterances.len(),
            chunks = total,
            "Transcription finished"
        );
        Self::record(ctx, Transcript::new(utterances, language));
        Ok(())
    }
}

/// Decodes `path` on a blocking thread, one chunk ahead of the consumer.
/// Dropping the receiver stops the decoder.
fn stream_chunks(
    path: PathBuf,
    chunk_seconds: f64,
    denoise: bool,
) -> (mpsc::Receiver<anyhow::Result<AudioChunk>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let decoder = tokio::task::spawn_blocking(move || {
        let chunks = match AudioChunks::open(&path, chunk_seconds, denoise) {
            Ok(chunks) => chunks,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for chunk in chunks {
            if tx.blocking_send(chunk).is_err() {
                break;
            }
        }
    });
    (rx, decoder)
}
