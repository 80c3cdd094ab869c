//! Transcription over an OpenAI-compatible `/audio/transcriptions` endpoint
//! (OpenAI, faster-whisper-server, whisper.cpp server).

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment, WordTimestamp};
use crate::audio::SAMPLE_RATE;
use crate::error::PipelineError;
use crate::model::{Device, LoadedModel, ModelKind, ModelLoader};

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<RemoteSegment>,
    #[serde(default)]
    words: Vec<RemoteWord>,
}

#[derive(Debug, Deserialize)]
struct RemoteSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RemoteWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default = "default_probability")]
    probability: f32,
}

fn default_probability() -> f32 {
    1.0
}

/// Encodes mono samples as a 16-bit PCM WAV file in memory.
pub fn encode_wav(samples: &[f32]) -> Result<Vec<u8>, PipelineError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(samples.len() * 2 + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| PipelineError::fatal(format!("failed to encode audio: {}", e)))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| PipelineError::fatal(format!("failed to encode audio: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::fatal(format!("failed to encode audio: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Attaches each word to the segment containing its midpoint.
fn assemble(response: VerboseTranscription) -> TranscribeResult {
    let mut segments: Vec<TranscribeSegment> = response
        .segments
        .into_iter()
        .map(|s| TranscribeSegment {
            text: s.text.trim().to_string(),
            start: s.start,
            end: s.end,
            words: Vec::new(),
        })
        .collect();

    if segments.is_empty() && !response.words.is_empty() {
        let start = response.words.first().map(|w| w.start).unwrap_or(0.0);
        let end = response.words.last().map(|w| w.end).unwrap_or(start);
        segments.push(TranscribeSegment {
            text: response.text.trim().to_string(),
            start,
            end,
            words: Vec::new(),
        });
    }

    for word in response.words {
        let mid = (word.start + word.end) / 2.0;
        let target = segments
            .iter()
            .position(|s| mid >= s.start && mid <= s.end)
            .or_else(|| segments.iter().rposition(|s| s.start <= mid));
        if let Some(index) = target {
            segments[index].words.push(WordTimestamp {
                word: word.word.trim().to_string(),
                start: word.start,
                end: word.end,
                probability: word.probability,
            });
        }
    }

    TranscribeResult {
        segments,
        full_text: response.text.trim().to_string(),
        language: response.language,
    }
}

pub struct RemoteAsr {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl RemoteAsr {
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl AsrEngine for RemoteAsr {
    async fn transcribe(&self, audio: Vec<f32>, params: AsrParams) -> Result<TranscribeResult, PipelineError> {
        let wav = encode_wav(&audio)?;
        let file = Part::bytes(wav)
            .file_name("chunk.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::fatal(e.to_string()))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");
        if params.word_timestamps {
            form = form.text("timestamp_granularities[]", "word");
        }
        if let Some(language) = params.language {
            form = form.text("language", language);
        }
        if let Some(prompt) = params.initial_prompt {
            form = form.text("prompt", prompt);
        }

        let mut builder = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response: VerboseTranscription = builder.send().await?.error_for_status()?.json().await?;
        debug!(segments = response.segments.len(), words = response.words.len(), "Received transcription");
        Ok(assemble(response))
    }
}

pub struct RemoteAsrLoader {
    base_url: String,
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl RemoteAsrLoader {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[async_trait]
impl ModelLoader for RemoteAsrLoader {
    fn kind(&self) -> ModelKind {
        ModelKind::Transcription
    }

    async fn load(&self, device: Device) -> Result<LoadedModel, PipelineError> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| PipelineError::model_load(self.kind(), e.to_string()))?;

        let mut probe = client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            probe = probe.bearer_auth(key);
        }
        probe
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                PipelineError::model_load(
                    self.kind(),
                    format!("endpoint {} is not reachable: {}", self.base_url, e),
                )
            })?;

        info!(model = %self.model, device = %device, "Transcription endpoint ready");
        Ok(LoadedModel::Transcriber(Arc::new(RemoteAsr::new(
            client,
            self.base_url.clone(),
            self.model.clone(),
            self.api_key.clone(),
        ))))
    }
}
