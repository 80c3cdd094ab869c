use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::model::Device;
use crate::schedule::types::{ProcessingEstimate, Stage};

/// Weight of the newest observation in the moving average.
const EMA_ALPHA: f64 = 0.3;

/// (transcription, generation) slowdown relative to real time.
fn device_multipliers(device: Device) -> (f64, f64) {
    match device {
        Device::Cuda => (0.5, 0.3),
        Device::Metal => (0.7, 0.5),
        Device::Cpu => (2.0, 3.0),
    }
}

/// Duration-based guess used until a stage has been observed.
pub fn heuristic_seconds(stage: Stage, duration: f64, device: Device) -> f64 {
    let (transcribe, generate) = device_multipliers(device);
    match stage {
        Stage::ExtractingAudio => 2.0 + 0.02 * duration,
        Stage::Transcribing => 0.3 * duration * transcribe,
        Stage::GeneratingChapters => 60.0 * generate,
        Stage::Finalizing => 5.0,
    }
}

/// Observed processing speed, in seconds of work per second of media.
#[derive(Default)]
pub struct ThroughputStats {
    rates: Mutex<BTreeMap<Stage, f64>>,
}

impl ThroughputStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: Stage, elapsed_secs: f64, media_secs: f64) {
        if media_secs <= 0.0 || !elapsed_secs.is_finite() || elapsed_secs < 0.0 {
            return;
        }
        let observed = elapsed_secs / media_secs;
        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        rates
            .entry(stage)
            .and_modify(|rate| *rate = EMA_ALPHA * observed + (1.0 - EMA_ALPHA) * *rate)
            .or_insert(observed);
    }

    pub fn rate(&self, stage: Stage) -> Option<f64> {
        let rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        rates.get(&stage).copied()
    }

    pub fn estimate(&self, video_id: &str, duration: f64, device: Device) -> ProcessingEstimate {
        let per_stage_seconds: BTreeMap<Stage, f64> = Stage::PIPELINE
            .iter()
            .map(|&stage| {
                let seconds = match self.rate(stage) {
                    Some(rate) => rate * duration,
                    None => heuristic_seconds(stage, duration, device),
                };
                (stage, seconds)
            })
            .collect();
        let total_seconds = per_stage_seconds.values().sum();

        ProcessingEstimate {
            video_id: video_id.to_string(),
            duration,
            device,
            per_stage_seconds,
            total_seconds,
        }
    }
}
