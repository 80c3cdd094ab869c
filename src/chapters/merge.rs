use super::{sort_by_start, ChapterCandidate};

/// Folds `next` into `kept`: the earlier start and title survive, the
/// confidence is the larger of the two.
fn absorb(kept: &mut ChapterCandidate, next: ChapterCandidate) {
    kept.confidence = kept.confidence.max(next.confidence);
}

/// Sorts candidates and merges any two whose starts are closer than
/// `min_length` seconds. Duplicates produced by overlapping transcript
/// windows collapse here as well.
pub fn merge_candidates(mut candidates: Vec<ChapterCandidate>, min_length: f64) -> Vec<ChapterCandidate> {
    sort_by_start(&mut candidates);
    let mut merged: Vec<ChapterCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match merged.last_mut() {
            Some(last) if candidate.start_time - last.start_time < min_length => absorb(last, candidate),
            _ => merged.push(candidate),
        }
    }
    merged
}

/// Reduces sorted candidates to at most `max` entries by repeatedly merging
/// the adjacent pair with the lowest combined confidence. Ties go to the
/// earliest pair.
pub fn cap_chapters(mut candidates: Vec<ChapterCandidate>, max: usize) -> Vec<ChapterCandidate> {
    let max = max.max(1);
    while candidates.len() > max {
        let mut best = 0;
        let mut best_score = f64::INFINITY;
        for i in 0..candidates.len() - 1 {
            let score = candidates[i].confidence + candidates[i + 1].confidence;
            if score < best_score {
                best = i;
                best_score = score;
            }
        }
        let next = candidates.remove(best + 1);
        absorb(&mut candidates[best], next);
    }
    candidates
}
