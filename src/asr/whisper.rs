use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

use super::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment, WordTimestamp};
use crate::error::PipelineError;
use crate::model::{Device, LoadedModel, ModelKind, ModelLoader};

pub struct WhisperAsr {
    whisper_ctx: Arc<WhisperContext>,
}

impl WhisperAsr {
    pub fn new(model_path: &str, device: Device) -> Result<Self> {
        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu(device.is_accelerated());
        match WhisperContext::new_with_params(model_path, ctx_params) {
            Ok(whisper_ctx) => Ok(Self {
                whisper_ctx: Arc::new(whisper_ctx),
            }),
            Err(e) => Err(anyhow!("failed to open whisper model: {}", e)),
        }
    }
}

fn build_params(ap: &AsrParams) -> FullParams<'_, '_> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

    // low temperature keeps output deterministic
    params.set_temperature(0.2);
    params.set_n_threads(8);
    params.set_translate(false);
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    // keep context across segments, it helps long recordings
    params.set_no_context(false);
    params.set_single_segment(false);
    params.set_suppress_blank(true);
    params.set_suppress_non_speech_tokens(true);
    params.set_token_timestamps(ap.word_timestamps);
    params.set_max_initial_ts(1.0);

    if let Some(language) = ap.language.as_deref() {
        params.set_language(Some(language));
    } else {
        params.set_language(Some("auto"));
    }
    if let Some(prompt) = ap.initial_prompt.as_deref() {
        params.set_initial_prompt(prompt);
    }
    params
}

/// Whisper timestamps are in centiseconds.
fn to_seconds(t: i64) -> f64 {
    t as f64 / 100.0
}

/// Groups sub-word tokens into words; a token starting with a space opens
/// a new word.
fn segment_words(state: &WhisperState, segment: i32) -> Result<Vec<WordTimestamp>> {
    let mut words: Vec<WordTimestamp> = Vec::new();
    let n_tokens = state.full_n_tokens(segment)?;
    for token in 0..n_tokens {
        let text = state.full_get_token_text(segment, token)?;
        if text.starts_with("[_") || text.starts_with("<|") || text.trim().is_empty() {
            continue;
        }
        let data = state.full_get_token_data(segment, token)?;
        let (start, end) = (to_seconds(data.t0), to_seconds(data.t1));
        match words.last_mut() {
            Some(word) if !text.starts_with(' ') => {
                word.word.push_str(&text);
                word.end = end;
                word.probability = word.probability.min(data.p);
            }
            _ => words.push(WordTimestamp {
                word: text.trim().to_string(),
                start,
                end,
                probability: data.p,
            }),
        }
    }
    Ok(words)
}

fn run_whisper(ctx: &WhisperContext, audio: &[f32], ap: &AsrParams) -> Result<TranscribeResult> {
    let mut state = ctx.create_state()?;
    state.full(build_params(ap), audio)?;
    let num_segments = state.full_n_segments()?;

    let mut segments = Vec::new();
    let mut full_text = String::new();
    for i in 0..num_segments {
        let text = state.full_get_segment_text(i)?;
        let start = state.full_get_segment_t0(i)?;
        let end = state.full_get_segment_t1(i)?;
        let words = if ap.word_timestamps {
            segment_words(&state, i)?
        } else {
            Vec::new()
        };

        full_text.push_str(&text);
        segments.push(TranscribeSegment {
            text: text.trim().to_string(),
            start: to_seconds(start),
            end: to_seconds(end),
            words,
        });
    }

    Ok(TranscribeResult {
        segments,
        full_text: full_text.trim().to_string(),
        language: ap.language.clone(),
    })
}

#[async_trait]
impl AsrEngine for WhisperAsr {
    async fn transcribe(&self, audio: Vec<f32>, params: AsrParams) -> Result<TranscribeResult, PipelineError> {
        let ctx = self.whisper_ctx.clone();
        tokio::task::spawn_blocking(move || run_whisper(&ctx, &audio, &params))
            .await
            .map_err(|e| PipelineError::fatal(format!("whisper worker failed: {}", e)))?
            .map_err(|e| PipelineError::fatal(format!("whisper transcription failed: {}", e)))
    }
}

/// Loads a ggml whisper model from disk.
pub struct WhisperLoader {
    model_path: PathBuf,
}

impl WhisperLoader {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }
}

#[async_trait]
impl ModelLoader for WhisperLoader {
    fn kind(&self) -> ModelKind {
        ModelKind::Transcription
    }

    async fn load(&self, device: Device) -> Result<LoadedModel, PipelineError> {
        if !self.model_path.exists() {
            return Err(PipelineError::model_load(
                self.kind(),
                format!("model file {} does not exist", self.model_path.display()),
            ));
        }
        let path = self.model_path.to_string_lossy().to_string();
        info!(path = %path, device = %device, "Opening whisper model");
        let asr = tokio::task::spawn_blocking(move || WhisperAsr::new(&path, device))
            .await
            .map_err(|e| PipelineError::model_load(ModelKind::Transcription, e.to_string()))?
            .map_err(|e| PipelineError::model_load(ModelKind::Transcription, e.to_string()))?;
        Ok(LoadedModel::Transcriber(Arc::new(asr)))
    }
}
