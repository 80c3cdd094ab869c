use super::{cap_chapters, merge_candidates, Chapter, ChapterCandidate};
use crate::error::PipelineError;

const MAX_TITLE_CHARS: usize = 200;
const EPSILON: f64 = 1e-6;

/// Turns merged candidates into a chapter list that tiles `[0, duration]`.
///
/// Starts outside the video are dropped, close starts are merged, the count
/// is capped, the first chapter is pulled back to 0 and every end is set to
/// the next start (the last one to `duration`).
pub fn normalize_candidates(
    candidates: Vec<ChapterCandidate>,
    duration: f64,
    min_length: f64,
    max_chapters: usize,
) -> Result<Vec<Chapter>, PipelineError> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(PipelineError::validation(format!("video duration {} is not positive", duration)));
    }
    let inside: Vec<ChapterCandidate> = candidates
        .into_iter()
        .filter(|c| c.start_time.is_finite() && c.start_time >= 0.0 && c.start_time < duration)
        .collect();
    let mut kept = cap_chapters(merge_candidates(inside, min_length), max_chapters);
    if kept.is_empty() {
        return Err(PipelineError::validation("no chapter starts inside the video"));
    }
    kept[0].start_time = 0.0;

    let starts: Vec<f64> = kept.iter().map(|c| c.start_time).collect();
    Ok(kept
        .into_iter()
        .enumerate()
        .map(|(i, c)| Chapter {
            title: c.title,
            start_time: c.start_time,
            end_time: Some(starts.get(i + 1).copied().unwrap_or(duration)),
            confidence: Some(c.confidence),
            is_ai_generated: true,
            order: i as u32 + 1,
        })
        .collect())
}

/// Checks the tiling invariants of a finished chapter list.
pub fn validate_chapters(chapters: &[Chapter], duration: f64) -> Result<(), PipelineError> {
    let first = chapters
        .first()
        .ok_or_else(|| PipelineError::validation("chapter list is empty"))?;
    if first.start_time.abs() > EPSILON {
        return Err(PipelineError::validation(format!(
            "first chapter starts at {} instead of 0",
            first.start_time
        )));
    }

    for (i, chapter) in chapters.iter().enumerate() {
        let end = chapter
            .end_time
            .ok_or_else(|| PipelineError::validation(format!("chapter {} has no end time", i + 1)))?;
        if end <= chapter.start_time {
            return Err(PipelineError::validation(format!(
                "chapter {} ends at {} before it starts at {}",
                i + 1,
                end,
                chapter.start_time
            )));
        }
        let expected_end = chapters.get(i + 1).map(|next| next.start_time).unwrap_or(duration);
        if (end - expected_end).abs() > EPSILON {
            return Err(PipelineError::validation(format!(
                "chapter {} ends at {} but the next boundary is {}",
                i + 1,
                end,
                expected_end
            )));
        }
        if let Some(confidence) = chapter.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(PipelineError::validation(format!(
                    "chapter {} has confidence {} outside [0, 1]",
                    i + 1,
                    confidence
                )));
            }
        }
        if chapter.order != i as u32 + 1 {
            return Err(PipelineError::validation(format!(
                "chapter at position {} has order {}",
                i + 1,
                chapter.order
            )));
        }
        if chapter.title.trim().is_empty() {
            return Err(PipelineError::validation(format!("chapter {} has an empty title", i + 1)));
        }
    }
    Ok(())
}

fn clean_title(raw: &str, order: u32) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#')
        .trim()
        .to_string();
    if collapsed.is_empty() {
        return format!("Chapter {}", order);
    }
    if collapsed.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = collapsed.chars().take(MAX_TITLE_CHARS - 1).collect();
        return format!("{}…", truncated.trim_end());
    }
    collapsed
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Post-processing before persistence: tidies titles, rounds boundaries to
/// milliseconds while keeping the tiling exact, renumbers, then validates.
pub fn finalize_chapters(chapters: Vec<Chapter>, duration: f64) -> Result<Vec<Chapter>, PipelineError> {
    let starts: Vec<f64> = chapters
        .iter()
        .enumerate()
        .map(|(i, c)| if i == 0 { 0.0 } else { round_millis(c.start_time) })
        .collect();

    let finalized: Vec<Chapter> = chapters
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let order = i as u32 + 1;
            Chapter {
                title: clean_title(&c.title, order),
                start_time: starts[i],
                end_time: Some(starts.get(i + 1).copied().unwrap_or(duration)),
                confidence: c.confidence.map(|v| v.clamp(0.0, 1.0)),
                is_ai_generated: c.is_ai_generated,
                order,
            }
        })
        .collect();

    validate_chapters(&finalized, duration)?;
    Ok(finalized)
}
