use async_trait::async_trait;

use crate::error::PipelineError;
use crate::schedule::types::ProcessingConfig;
use crate::transcript::format_timestamp;

pub mod openai;

pub use openai::{OpenAiChatGenerator, OpenAiLoader};

/// Tokens kept free for the instructions and the model's answer when sizing
/// transcript windows.
pub const RESERVED_TOKENS: usize = 1500;

const SYSTEM_PROMPT: &str = r#"You divide video transcripts into chapters. Each chapter marks a real shift in topic and gets a short, descriptive title.

Rules:
- Respond with JSON only, no commentary.
- start_time is in seconds from the beginning of the video.
- confidence is a number between 0 and 1 describing how clear the topic boundary is.

Format:
{"chapters": [{"start_time": 0, "title": "Chapter title", "confidence": 0.9}]}"#;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Chapter-generation capability: completes a prompt.
#[async_trait]
pub trait ChapterGenerator: Send + Sync {
    /// Context window of the underlying model, in tokens.
    fn context_window(&self) -> usize;
    async fn generate(&self, request: &GenerationRequest) -> Result<String, PipelineError>;
}

/// Describes one transcript window for the prompt.
pub struct WindowPrompt<'a> {
    pub transcript: &'a str,
    pub window_start: f64,
    pub window_end: f64,
    pub index: usize,
    pub count: usize,
    pub video_duration: f64,
}

pub fn build_request(window: &WindowPrompt<'_>, config: &ProcessingConfig) -> GenerationRequest {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Video duration: {} seconds ({}).\n",
        window.video_duration.round() as u64,
        format_timestamp(window.video_duration)
    ));
    if window.count > 1 {
        prompt.push_str(&format!(
            "This is part {} of {} of the transcript, covering {} to {}. Only propose chapters that start inside this part.\n",
            window.index + 1,
            window.count,
            format_timestamp(window.window_start),
            format_timestamp(window.window_end),
        ));
    }
    prompt.push_str(&format!(
        "Chapters must be at least {} seconds long. Propose at most {} chapters for the whole video.\n",
        window.video_duration.min(config.min_chapter_length).round().max(1.0) as u64,
        config.max_chapters
    ));
    if let Some(guidance) = config.guidance_prompt.as_deref().filter(|g| !g.trim().is_empty()) {
        prompt.push_str(&format!("Additional guidance: {}\n", guidance.trim()));
    }
    prompt.push_str("\nTranscript ([HH:MM:SS] text):\n");
    prompt.push_str(window.transcript);

    GenerationRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        max_tokens: 1024,
        temperature: 0.3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_window_prompt_has_no_part_header() {
        let window = WindowPrompt {
            transcript: "[00:00:00] hello",
            window_start: 0.0,
            window_end: 600.0,
            index: 0,
            count: 1,
            video_duration: 600.0,
        };
        let request = build_request(&window, &ProcessingConfig::default());
        assert!(request.prompt.contains("600 seconds (00:10:00)"));
        assert!(!request.prompt.contains("part 1 of"));
        assert!(request.prompt.ends_with("[00:00:00] hello"));
        assert!(request.system.contains("\"chapters\""));
    }

    #[test]
    fn test_window_prompt_carries_range_and_guidance() {
        let window = WindowPrompt {
            transcript: "[00:05:00] later",
            window_start: 300.0,
            window_end: 600.0,
            index: 1,
            count: 3,
            video_duration: 900.0,
        };
        let config = ProcessingConfig {
            guidance_prompt: Some("  focus on recipes ".into()),
            ..ProcessingConfig::default()
        };
        let request = build_request(&window, &config);
        assert!(request.prompt.contains("part 2 of 3"));
        assert!(request.prompt.contains("00:05:00 to 00:10:00"));
        assert!(request.prompt.contains("Additional guidance: focus on recipes\n"));
    }
}
