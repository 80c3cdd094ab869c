use serde::{Deserialize, Serialize};

pub mod export;
pub mod fallback;
pub mod merge;
pub mod parse;
pub mod validate;

pub use export::{export_chapters, ExportFormat, ExportOptions};
pub use fallback::fallback_candidates;
pub use merge::{cap_chapters, merge_candidates};
pub use parse::parse_chapter_response;
pub use validate::{finalize_chapters, normalize_candidates, validate_chapters};

/// A chapter as persisted and exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub confidence: Option<f64>,
    pub is_ai_generated: bool,
    /// 1-based position.
    pub order: u32,
}

/// A proposed chapter start, before merging and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterCandidate {
    pub start_time: f64,
    pub title: String,
    pub confidence: f64,
}

impl ChapterCandidate {
    pub fn new(start_time: f64, title: impl Into<String>, confidence: f64) -> Self {
        Self {
            start_time,
            title: title.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Sorts by start time; NaN-free input is assumed.
pub(crate) fn sort_by_start(candidates: &mut [ChapterCandidate]) {
    candidates.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
}
