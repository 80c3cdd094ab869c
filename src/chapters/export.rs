use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::Chapter;
use crate::transcript::format_timestamp;

/// Chapters with no end are exported as one minute long.
const DEFAULT_EXPORT_LENGTH: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Srt,
    Vtt,
    Csv,
    Txt,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Srt => "application/x-subrip",
            ExportFormat::Vtt => "text/vtt",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Txt => "text/plain; charset=utf-8",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "srt" => Ok(ExportFormat::Srt),
            "vtt" | "webvtt" => Ok(ExportFormat::Vtt),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "text" => Ok(ExportFormat::Txt),
            other => Err(anyhow!("Unsupported export format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub include_timestamps: bool,
    pub include_confidence: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_timestamps: true,
            include_confidence: true,
        }
    }
}

fn split_time(seconds: f64) -> (u64, u64, u64, u64) {
    let millis_total = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = millis_total % 1000;
    let total = millis_total / 1000;
    (total / 3600, (total % 3600) / 60, total % 60, millis)
}

/// `HH:MM:SS,mmm`
pub fn format_srt_time(seconds: f64) -> String {
    let (h, m, s, ms) = split_time(seconds);
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

/// `HH:MM:SS.mmm`
pub fn format_vtt_time(seconds: f64) -> String {
    let (h, m, s, ms) = split_time(seconds);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}

fn end_of(chapter: &Chapter) -> f64 {
    chapter
        .end_time
        .unwrap_or(chapter.start_time + DEFAULT_EXPORT_LENGTH)
}

fn csv_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn to_srt(chapters: &[Chapter]) -> String {
    let mut out = String::new();
    for (i, chapter) in chapters.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_time(chapter.start_time),
            format_srt_time(end_of(chapter)),
            chapter.title
        ));
    }
    out
}

fn to_vtt(chapters: &[Chapter]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for chapter in chapters {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_vtt_time(chapter.start_time),
            format_vtt_time(end_of(chapter)),
            chapter.title
        ));
    }
    out
}

fn to_csv(chapters: &[Chapter], options: ExportOptions) -> String {
    let mut headers = vec!["Title", "Start Time", "End Time"];
    if options.include_timestamps {
        headers.extend(["Start Timestamp", "End Timestamp"]);
    }
    if options.include_confidence {
        headers.push("Confidence");
    }

    let mut lines = vec![headers.join(",")];
    for chapter in chapters {
        let mut row = vec![
            csv_quote(&chapter.title),
            chapter.start_time.to_string(),
            chapter.end_time.map(|e| e.to_string()).unwrap_or_default(),
        ];
        if options.include_timestamps {
            row.push(csv_quote(&format_timestamp(chapter.start_time)));
            row.push(csv_quote(
                &chapter.end_time.map(format_timestamp).unwrap_or_default(),
            ));
        }
        if options.include_confidence {
            row.push(chapter.confidence.map(|c| format!("{:.2}", c)).unwrap_or_default());
        }
        lines.push(row.join(","));
    }
    lines.join("\n")
}

fn to_txt(chapters: &[Chapter], options: ExportOptions) -> String {
    chapters
        .iter()
        .map(|chapter| {
            let mut line = format!("{} - {}", format_timestamp(chapter.start_time), chapter.title);
            if options.include_confidence {
                if let Some(confidence) = chapter.confidence.filter(|c| *c > 0.0) {
                    line.push_str(&format!(" (Confidence: {:.2})", confidence));
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders chapters in the requested format.
pub fn export_chapters(chapters: &[Chapter], format: ExportFormat, options: ExportOptions) -> Result<String> {
    Ok(match format {
        ExportFormat::Json => serde_json::to_string_pretty(chapters)?,
        ExportFormat::Srt => to_srt(chapters),
        ExportFormat::Vtt => to_vtt(chapters),
        ExportFormat::Csv => to_csv(chapters, options),
        ExportFormat::Txt => to_txt(chapters, options),
    })
}
