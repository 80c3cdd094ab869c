use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::ChapterCandidate;
use crate::error::PipelineError;

/// Confidence used when the model's JSON omits one.
pub const DEFAULT_JSON_CONFIDENCE: f64 = 0.8;
/// Confidence assigned to chapters recovered from free-text lines.
pub const LINE_CONFIDENCE: f64 = 0.7;

static LINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•]|\d+[.)])?\s*\[?(\d{1,2}:\d{2}(?::\d{2})?)\]?\s*[-–—:]?\s*(.+?)\s*$")
        .expect("valid chapter line pattern")
});

#[derive(Debug, Deserialize)]
struct RawResponse {
    chapters: Vec<RawChapter>,
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    start_time: Value,
    title: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parses `SS`, `MM:SS` or `HH:MM:SS`.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let numbers = parts
        .iter()
        .map(|p| p.trim().parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    let seconds = match numbers.as_slice() {
        [s] => *s,
        [m, s] => m * 60.0 + s,
        [h, m, s] => h * 3600.0 + m * 60.0 + s,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

fn start_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite() && *v >= 0.0),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn parse_json(text: &str) -> Option<Vec<ChapterCandidate>> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    if close <= open {
        return None;
    }
    let raw: RawResponse = serde_json::from_str(&text[open..=close]).ok()?;
    let candidates: Vec<ChapterCandidate> = raw
        .chapters
        .into_iter()
        .filter_map(|c| {
            let title = c.title.trim();
            if title.is_empty() {
                return None;
            }
            let start = start_seconds(&c.start_time)?;
            let confidence = c
                .confidence
                .filter(|v| v.is_finite())
                .unwrap_or(DEFAULT_JSON_CONFIDENCE);
            Some(ChapterCandidate::new(start, title, confidence))
        })
        .collect();
    (!candidates.is_empty()).then_some(candidates)
}

fn parse_lines(text: &str) -> Vec<ChapterCandidate> {
    text.lines()
        .filter_map(|line| {
            let caps = LINE_PATTERN.captures(line)?;
            let start = parse_timestamp(caps.get(1)?.as_str())?;
            let title = caps.get(2)?.as_str().trim_matches(|c| c == '"' || c == '*').trim();
            (title.chars().count() > 3).then(|| ChapterCandidate::new(start, title, LINE_CONFIDENCE))
        })
        .collect()
}

/// Extracts chapter candidates from raw model output.
///
/// The JSON object form is tried first (embedded in prose or code fences is
/// fine); otherwise `MM:SS - Title` style lines are collected. Output with
/// neither is a validation failure.
pub fn parse_chapter_response(text: &str) -> Result<Vec<ChapterCandidate>, PipelineError> {
    if let Some(candidates) = parse_json(text) {
        return Ok(candidates);
    }
    let candidates = parse_lines(text);
    if candidates.is_empty() {
        return Err(PipelineError::validation(
            "model output contained no recognizable chapters",
        ));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("42"), Some(42.0));
        assert_eq!(parse_timestamp("1:30"), Some(90.0));
        assert_eq!(parse_timestamp("01:02:03"), Some(3723.0));
        assert_eq!(parse_timestamp("1:2:3:4"), None);
        assert_eq!(parse_timestamp("ab:cd"), None);
    }

    #[test]
    fn test_json_inside_code_fence() -> anyhow::Result<()> {
        let text = r#"Sure! Here are the chapters:
```json
{"chapters": [
  {"start_time": 0, "title": "Intro", "confidence": 0.95},
  {"start_time": "02:30", "title": "Setting up the grill"},
  {"start_time": 400, "title": "Tasting", "confidence": 1.7}
]}
```"#;
        let chapters = parse_chapter_response(text)?;
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].confidence, 0.95);
        assert_eq!(chapters[1].start_time, 150.0);
        assert_eq!(chapters[1].confidence, DEFAULT_JSON_CONFIDENCE);
        assert_eq!(chapters[2].confidence, 1.0);
        Ok(())
    }

    #[test]
    fn test_json_skips_unusable_entries() -> anyhow::Result<()> {
        let text = r#"{"chapters": [
            {"start_time": -5, "title": "Negative"},
            {"start_time": 10, "title": "   "},
            {"start_time": null, "title": "Null"},
            {"start_time": 60, "title": "Kept"}
        ]}"#;
        let chapters = parse_chapter_response(text)?;
        assert_eq!(chapters, vec![ChapterCandidate::new(60.0, "Kept", DEFAULT_JSON_CONFIDENCE)]);
        Ok(())
    }

    #[test]
    fn test_line_format_fallback() -> anyhow::Result<()> {
        let text = "Chapters:\n0:00 - Welcome and overview\n- 05:10 – Knife skills\n3. [1:02:03] **Plating**\n7:00 - Hi\n";
        let chapters = parse_chapter_response(text)?;
        let starts: Vec<f64> = chapters.iter().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![0.0, 310.0, 3723.0]);
        assert_eq!(chapters[2].title, "Plating");
        assert!(chapters.iter().all(|c| c.confidence == LINE_CONFIDENCE));
        Ok(())
    }

    #[test]
    fn test_empty_json_list_falls_through_to_lines() -> anyhow::Result<()> {
        let text = "{\"chapters\": []}\n00:45 Getting started";
        let chapters = parse_chapter_response(text)?;
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].start_time, 45.0);
        Ok(())
    }

    #[test]
    fn test_garbage_is_a_validation_error() {
        let result = parse_chapter_response("I cannot help with that request.");
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}
