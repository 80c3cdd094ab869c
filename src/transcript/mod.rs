//! Time-aligned transcript built from transcription segments, and the
//! windowing used to feed it to the chapter generator.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::asr::{TranscribeSegment, WordTimestamp};

/// Gap between words that always starts a new utterance.
const MAX_WORD_GAP: f64 = 1.0;
/// Utterances are split once they would exceed this length.
const MAX_UTTERANCE_SECONDS: f64 = 20.0;
/// Sentence-final punctuation only splits utterances at least this long.
const MIN_SENTENCE_SECONDS: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub utterances: Vec<Utterance>,
    pub language: Option<String>,
    pub word_count: usize,
}

impl Transcript {
    pub fn new(utterances: Vec<Utterance>, language: Option<String>) -> Self {
        let word_count = utterances
            .iter()
            .map(|u| u.text.split_whitespace().count())
            .sum();
        Self {
            utterances,
            language,
            word_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.iter().all(|u| u.text.trim().is_empty())
    }

    /// `[HH:MM:SS] text` lines for the utterances in `range`.
    pub fn render(&self, range: Range<usize>) -> String {
        self.utterances[range]
            .iter()
            .map(render_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn render_line(utterance: &Utterance) -> String {
    format!("[{}] {}", format_timestamp(utterance.start), utterance.text)
}

/// `HH:MM:SS`, truncating fractional seconds.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn ends_sentence(word: &str) -> bool {
    word.ends_with(['.', '?', '!', '。', '？', '！'])
}

fn push_utterance(out: &mut Vec<Utterance>, words: &[&WordTimestamp], offset: f64) {
    let (Some(first), Some(last)) = (words.first(), words.last()) else {
        return;
    };
    let text = words
        .iter()
        .map(|w| w.word.trim())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return;
    }
    out.push(Utterance {
        start: first.start + offset,
        end: last.end + offset,
        text,
    });
}

/// Builds utterances from transcription segments whose timestamps are
/// relative to a chunk starting at `offset` seconds.
///
/// Word timestamps drive the split: a pause longer than a second, a
/// sentence end once the utterance is a few seconds long, or a runaway
/// length each close the current utterance. Segments without words become
/// one utterance each.
pub fn utterances_from_segments(segments: &[TranscribeSegment], offset: f64) -> Vec<Utterance> {
    let mut out = Vec::new();
    for segment in segments {
        if segment.words.is_empty() {
            let text = segment.text.trim();
            if !text.is_empty() {
                out.push(Utterance {
                    start: segment.start + offset,
                    end: segment.end.max(segment.start) + offset,
                    text: text.to_string(),
                });
            }
            continue;
        }

        let mut current: Vec<&WordTimestamp> = Vec::new();
        for word in &segment.words {
            if let (Some(first), Some(prev)) = (current.first(), current.last()) {
                let gap = word.start - prev.end;
                let length = word.end - first.start;
                let sentence_done =
                    ends_sentence(prev.word.trim()) && prev.end - first.start >= MIN_SENTENCE_SECONDS;
                if gap > MAX_WORD_GAP || length > MAX_UTTERANCE_SECONDS || sentence_done {
                    push_utterance(&mut out, &current, offset);
                    current.clear();
                }
            }
            current.push(word);
        }
        push_utterance(&mut out, &current, offset);
    }
    out
}

/// Rough token count used to size prompts: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

/// Splits utterances into ordered windows of at most `max_tokens` rendered
/// tokens. Consecutive windows share about `overlap_tokens` of trailing
/// context. A single utterance larger than the budget gets its own window.
pub fn split_windows(utterances: &[Utterance], max_tokens: usize, overlap_tokens: usize) -> Vec<Range<usize>> {
    let costs: Vec<usize> = utterances
        .iter()
        .map(|u| estimate_tokens(&render_line(u)))
        .collect();
    let max_tokens = max_tokens.max(1);

    let mut windows = Vec::new();
    let mut start = 0;
    while start < costs.len() {
        let mut end = start;
        let mut used = 0;
        while end < costs.len() && (end == start || used + costs[end] <= max_tokens) {
            used += costs[end];
            end += 1;
        }
        windows.push(start..end);
        if end >= costs.len() {
            break;
        }

        // step back to carry some context into the next window
        let mut next = end;
        let mut carried = 0;
        while next > start + 1 && carried + costs[next - 1] <= overlap_tokens {
            carried += costs[next - 1];
            next -= 1;
        }
        start = next;
    }
    windows
}
