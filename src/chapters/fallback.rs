use super::ChapterCandidate;

/// Deterministic chapters used when generation yields nothing usable:
/// `min(max_chapters, max(1, ceil(duration / min_length)))` evenly spaced
/// starts titled "Chapter N", each with zero confidence.
pub fn fallback_candidates(duration: f64, min_length: f64, max_chapters: usize) -> Vec<ChapterCandidate> {
    let duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
    let by_length = if min_length > 0.0 {
        (duration / min_length).ceil() as usize
    } else {
        1
    };
    let count = by_length.max(1).min(max_chapters.max(1));
    let spacing = duration / count as f64;

    (0..count)
        .map(|i| ChapterCandidate::new(i as f64 * spacing, format!("Chapter {}", i + 1), 0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_by_max_chapters() {
        let chapters = fallback_candidates(600.0, 30.0, 5);
        let starts: Vec<f64> = chapters.iter().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![0.0, 120.0, 240.0, 360.0, 480.0]);
        assert_eq!(chapters[4].title, "Chapter 5");
        assert!(chapters.iter().all(|c| c.confidence == 0.0));
    }

    #[test]
    fn test_count_follows_min_length() {
        let chapters = fallback_candidates(100.0, 30.0, 15);
        assert_eq!(chapters.len(), 4);
        assert_eq!(chapters[1].start_time, 25.0);
    }

    #[test]
    fn test_short_video_gets_one_chapter() {
        let chapters = fallback_candidates(10.0, 30.0, 15);
        assert_eq!(chapters, vec![ChapterCandidate::new(0.0, "Chapter 1", 0.0)]);
        assert_eq!(fallback_candidates(0.0, 30.0, 15).len(), 1);
    }

    #[test]
    fn test_is_deterministic() {
        assert_eq!(fallback_candidates(3600.0, 45.0, 12), fallback_candidates(3600.0, 45.0, 12));
    }
}
