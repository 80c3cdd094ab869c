use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub mod remote;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use remote::{RemoteAsr, RemoteAsrLoader};

#[derive(Debug, Clone, Default)]
pub struct AsrParams {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub word_timestamps: bool,
}

impl AsrParams {
    pub fn new() -> Self {
        Self {
            word_timestamps: true,
            ..Self::default()
        }
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language;
        self
    }

    pub fn set_initial_prompt(&mut self, prompt: Option<String>) -> &mut Self {
        self.initial_prompt = prompt;
        self
    }

    pub fn set_word_timestamps(&mut self, enabled: bool) -> &mut Self {
        self.word_timestamps = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub probability: f32,
}

/// Times are seconds relative to the start of the audio passed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub words: Vec<WordTimestamp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub segments: Vec<TranscribeSegment>,
    pub full_text: String,
    pub language: Option<String>,
}

/// Transcription capability. `audio` is 16 kHz mono in [-1, 1].
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, audio: Vec<f32>, params: AsrParams) -> Result<TranscribeResult, PipelineError>;
}
