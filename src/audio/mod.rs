use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, WindowFunction};
use rustfft::{num_complex::Complex, FftPlanner};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Sample rate expected by the transcription capability.
pub const SAMPLE_RATE: u32 = 16_000;

/// Frame energy below this counts as silence.
const SILENCE_ENERGY: f32 = 1e-5;
/// Peaks below this are left unnormalized so noise is not amplified.
const NOISE_FLOOR: f32 = 0.02;
const VAD_FRAME: usize = 1024;
/// Input frames fed to the resampler per call.
const RESAMPLE_BLOCK: usize = 1024;

/// Extracts the audio track of a video into a 16 kHz mono PCM WAV file.
///
/// # Arguments
/// * `video` - source video on local storage
/// * `dest` - output path, overwritten if present
///
/// # Errors
/// A missing source, a missing ffmpeg binary or a failed conversion are
/// fatal for the stage; none of them improve on retry.
pub async fn extract_audio(video: &Path, dest: &Path) -> Result<(), PipelineError> {
    if !video.exists() {
        return Err(PipelineError::fatal(format!(
            "Source video {} does not exist.",
            video.display()
        )));
    }
    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    info!("Extracting audio from {:?}", video);
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(video)
        .arg("-vn")
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg("-ar")
        .arg(SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg("1")
        .arg("-y")
        .arg(dest)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PipelineError::fatal(format!("Failed to execute ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("no output").trim().to_string();
        return Err(PipelineError::fatal(format!(
            "Audio extraction failed ({}): {}",
            output.status, detail
        )));
    }
    Ok(())
}

/// Reads the container duration in seconds with ffprobe.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to execute ffprobe: {}", e))?;

    if !output.status.success() {
        return Err(anyhow!("ffprobe failed with status: {}", output.status));
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow!("ffprobe returned an unreadable duration {:?}: {}", raw.trim(), e))?;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(anyhow!("ffprobe returned a non-positive duration: {}", duration));
    }
    Ok(duration)
}

/// One decoded slice of an audio track, resampled to 16 kHz mono.
#[derive(Debug)]
pub struct AudioChunk {
    pub index: usize,
    pub total: usize,
    /// Position of the first sample in the track, in seconds.
    pub offset: f64,
    pub samples: Vec<f32>,
}

/// Streams a 16-bit PCM WAV file as fixed-length chunks.
///
/// Opening the file scans it once for its peak so every chunk is scaled by
/// the same gain. After that only one chunk is held in memory at a time.
///
/// # Steps per chunk
/// 1. read the chunk's frames
/// 2. mix down to mono
/// 3. optionally reduce noise
/// 4. apply the track gain unless the track is near silent
/// 5. resample to 16 kHz if needed
pub struct AudioChunks {
    reader: WavReader<BufReader<File>>,
    channels: usize,
    sample_rate: u32,
    chunk_frames: usize,
    gain: f32,
    denoise: bool,
    next_index: usize,
    total: usize,
}

impl AudioChunks {
    /// # Arguments
    /// * `path` - 16-bit PCM WAV file
    /// * `chunk_seconds` - chunk duration, at least one second
    /// * `denoise` - apply spectral noise reduction per chunk
    pub fn open(path: &Path, chunk_seconds: f64, denoise: bool) -> Result<Self> {
        let track_peak = scan_peak(path)?;
        let reader = open_wav(path)?;
        let spec = reader.spec();
        let chunk_frames = chunk_frames(chunk_seconds, spec.sample_rate);
        let total = (reader.duration() as usize).div_ceil(chunk_frames);
        debug!(
            "Streaming {} chunk(s) of {} frames at {} Hz",
            total, chunk_frames, spec.sample_rate
        );

        Ok(Self {
            channels: spec.channels as usize,
            sample_rate: spec.sample_rate,
            chunk_frames,
            gain: gain_for_peak(track_peak),
            denoise,
            next_index: 0,
            total,
            reader,
        })
    }

    /// Number of chunks in the track.
    pub fn total(&self) -> usize {
        self.total
    }

    fn decode_chunk(&mut self, index: usize) -> Result<AudioChunk> {
        let wanted = self.chunk_frames * self.channels;
        let raw = self
            .reader
            .samples::<i16>()
            .take(wanted)
            .map(|s| s.map(|val| val as f32 / 32768.0))
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| anyhow!("Failed to read samples: {}", e))?;

        let mono = convert_to_mono(raw, self.channels);
        let mut cleaned = if self.denoise && mono.len() >= 2048 {
            spectral_noise_reduction(&mono, 2048, 0.75, 0.55)
        } else {
            mono
        };
        if self.gain != 1.0 {
            let gain = self.gain;
            cleaned.par_iter_mut().for_each(|s| *s *= gain);
        }

        let samples = if self.sample_rate != SAMPLE_RATE {
            resample_audio(&cleaned, self.sample_rate)?
        } else {
            cleaned
        };

        Ok(AudioChunk {
            index,
            total: self.total,
            offset: (index * self.chunk_frames) as f64 / self.sample_rate as f64,
            samples,
        })
    }
}

impl Iterator for AudioChunks {
    type Item = Result<AudioChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.total {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        let chunk = self.decode_chunk(index);
        if chunk.is_err() {
            self.next_index = self.total;
        }
        Some(chunk)
    }
}

/// Opens a WAV file, accepting only 16-bit integer PCM.
fn open_wav(path: &Path) -> Result<WavReader<BufReader<File>>> {
    let reader = WavReader::open(path).map_err(|e| anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Int {
        return Err(anyhow!("Unsupported sample format: expected integer format"));
    }
    if spec.bits_per_sample != 16 {
        return Err(anyhow!("Unsupported bits per sample: expected 16 bits"));
    }
    if spec.channels == 0 {
        return Err(anyhow!("WAV file declares zero channels"));
    }
    if spec.sample_rate == 0 {
        return Err(anyhow!("WAV file declares a zero sample rate"));
    }
    Ok(reader)
}

/// Largest absolute sample of the whole file, in [0, 1].
fn scan_peak(path: &Path) -> Result<f32> {
    let mut reader = open_wav(path)?;
    let max = reader
        .samples::<i16>()
        .try_fold(0i32, |max, s| s.map(|val| max.max((val as i32).abs())))
        .map_err(|e| anyhow!("Failed to read samples: {}", e))?;
    Ok(max as f32 / 32768.0)
}

/// Averages interleaved channels into one.
fn convert_to_mono(samples: Vec<f32>, num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples;
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

fn peak(samples: &[f32]) -> f32 {
    samples.par_iter().map(|s| s.abs()).reduce(|| 0.0, f32::max)
}

/// Gain that brings `peak` to 1.0. Near-silent tracks keep unit gain.
fn gain_for_peak(peak: f32) -> f32 {
    if peak < NOISE_FLOOR {
        1.0
    } else {
        1.0 / peak
    }
}

/// Resamples mono audio to 16 kHz.
///
/// The output is aligned with the input: the filter delay is dropped and
/// the tail is flushed, so `n` input frames give `n * ratio` output frames.
fn resample_audio(samples: &[f32], original_sample_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    debug!("Resampling from {} Hz to {} Hz", original_sample_rate, SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = SAMPLE_RATE as f64 / original_sample_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_BLOCK, 1)
        .map_err(|e| anyhow!("Failed to create resampler: {}", e))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_BLOCK);

    let mut input = samples;
    while input.len() >= resampler.input_frames_next() {
        let (block, rest) = input.split_at(resampler.input_frames_next());
        let out = resampler
            .process(&[block], None)
            .map_err(|e| anyhow!("Resampling failed: {}", e))?;
        output.extend_from_slice(&out[0]);
        input = rest;
    }
    if !input.is_empty() {
        let out = resampler
            .process_partial(Some(&[input][..]), None)
            .map_err(|e| anyhow!("Resampling failed: {}", e))?;
        output.extend_from_slice(&out[0]);
    }
    // flush what is still inside the filter
    while output.len() < expected + delay {
        let out = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| anyhow!("Resampling failed: {}", e))?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Whether no frame of `samples` carries speech-level energy.
///
/// # Arguments
/// * `samples` - mono samples in [-1, 1]
pub fn is_silent(samples: &[f32]) -> bool {
    !samples.par_chunks(VAD_FRAME).any(|frame| {
        let energy = frame.iter().map(|&s| s * s).sum::<f32>() / frame.len() as f32;
        energy > SILENCE_ENERGY
    })
}

/// Frames in a chunk of `seconds` at `sample_rate`, never less than one second.
fn chunk_frames(seconds: f64, sample_rate: u32) -> usize {
    ((seconds * sample_rate as f64) as usize).max(sample_rate as usize)
}

/// Spectral-subtraction denoiser working on overlapping Hann windows.
///
/// # Arguments
/// * `samples` - mono input
/// * `frame_size` - FFT frame, a power of two such as 1024 or 2048
/// * `overlap` - frame overlap ratio, usually 0.5 or 0.75
/// * `strength` - 0.0 to 1.0
pub fn spectral_noise_reduction(samples: &[f32], frame_size: usize, overlap: f32, strength: f32) -> Vec<f32> {
    if samples.len() < frame_size || frame_size < 2 {
        return samples.to_vec();
    }
    let step_size = ((frame_size as f32 * (1.0 - overlap)) as usize).max(1);
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(frame_size);
    let ifft = planner.plan_fft_inverse(frame_size);

    let frames = samples.windows(frame_size).step_by(step_size).collect::<Vec<_>>();
    let noise_power = estimate_noise_power(&frames, &fft);

    let processed_frames: Vec<Vec<Complex<f32>>> = frames
        .par_iter()
        .map(|frame| {
            let mut spectrum: Vec<Complex<f32>> = frame
                .iter()
                .enumerate()
                .map(|(i, &s)| Complex::new(s * hann_window(i, frame_size), 0.0))
                .collect();

            fft.process(&mut spectrum);
            for (i, bin) in spectrum.iter_mut().enumerate() {
                let snr = bin.norm_sqr() / (noise_power[i] + 1e-10);
                let gain = 1.0 - (strength / (snr + 1.0)).min(1.0);
                *bin *= gain.sqrt();
            }
            ifft.process(&mut spectrum);
            spectrum
        })
        .collect();

    let mut output = vec![0.0; samples.len()];
    for (i, frame) in processed_frames.iter().enumerate() {
        let start = i * step_size;
        for (j, bin) in frame.iter().enumerate() {
            if start + j < output.len() {
                output[start + j] += bin.re / frame_size as f32;
            }
        }
    }

    remove_dc_offset(&mut output);

    // restore the input's peak level
    let out_peak = peak(&output);
    if out_peak > 0.0 {
        let gain = peak(samples) / out_peak;
        output.iter_mut().for_each(|x| *x *= gain);
    }
    output
}

fn estimate_noise_power(frames: &[&[f32]], fft: &Arc<dyn rustfft::Fft<f32>>) -> Vec<f32> {
    let frame_size = fft.len();
    let mut noise_power = vec![0.0; frame_size];
    // leading frames are assumed to be mostly background
    let num_frames = frames.len().clamp(1, 20);

    for frame in frames.iter().take(num_frames) {
        let mut spectrum: Vec<Complex<f32>> = frame
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * hann_window(i, frame_size), 0.0))
            .collect();
        fft.process(&mut spectrum);
        for (i, bin) in spectrum.iter().enumerate() {
            noise_power[i] += bin.norm_sqr() / num_frames as f32;
        }
    }

    smooth_signal(&noise_power, 7)
}

fn hann_window(i: usize, size: usize) -> f32 {
    0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
}

fn smooth_signal(signal: &[f32], window_size: usize) -> Vec<f32> {
    let half_window = window_size / 2;
    (0..signal.len())
        .map(|i| {
            let start = i.saturating_sub(half_window);
            let end = (i + half_window + 1).min(signal.len());
            signal[start..end].iter().sum::<f32>() / (end - start) as f32
        })
        .collect()
}

fn remove_dc_offset(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
    samples.iter_mut().for_each(|s| *s -= mean);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32).sin() * amplitude)
            .collect()
    }

    fn write_wav(path: &Path, samples: &[f32], channels: u16, sample_rate: u32) -> Result<()> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &s in samples {
            writer.write_sample((s * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
        Ok(())
    }

    #[test]
    fn test_silence_detection() {
        assert!(is_silent(&vec![0.0; 16_000]));
        assert!(is_silent(&[]));
        assert!(!is_silent(&tone(16_000, 0.3)));
    }

    fn sine(len: usize, sample_rate: u32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_gain_leaves_noise_floor_alone() {
        assert_eq!(gain_for_peak(0.002), 1.0);
        assert_eq!(gain_for_peak(0.5), 2.0);
    }

    #[test]
    fn test_stereo_mixdown() {
        assert_eq!(convert_to_mono(vec![0.2, 0.4, -0.2, -0.4], 2), vec![0.3, -0.3]);
    }

    #[test]
    fn test_chunks_from_stereo_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stereo.wav");
        let mono = tone(8_000, 0.5);
        let interleaved: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        write_wav(&path, &interleaved, 2, SAMPLE_RATE)?;

        let chunks = AudioChunks::open(&path, 300.0, false)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples.len(), 8_000);
        assert!((peak(&chunks[0].samples) - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_chunks_stream_with_one_track_gain() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("long.wav");
        let mut samples = tone(16_000, 0.1);
        samples.extend(tone(16_000, 0.5));
        samples.extend(tone(8_000, 0.1));
        write_wav(&path, &samples, 1, SAMPLE_RATE)?;

        let mut chunks = AudioChunks::open(&path, 1.0, false)?;
        assert_eq!(chunks.total(), 3);

        let first = chunks.next().unwrap()?;
        assert_eq!((first.index, first.total, first.offset), (0, 3, 0.0));
        assert_eq!(first.samples.len(), 16_000);
        // scaled by the loud middle second, not by its own peak
        assert!((peak(&first.samples) - 0.2).abs() < 1e-2);

        let second = chunks.next().unwrap()?;
        assert_eq!(second.offset, 1.0);
        assert!((peak(&second.samples) - 1.0).abs() < 1e-3);

        let third = chunks.next().unwrap()?;
        assert_eq!(third.offset, 2.0);
        assert_eq!(third.samples.len(), 8_000);
        assert!(chunks.next().is_none());
        Ok(())
    }

    #[test]
    fn test_chunks_resample_to_exact_length() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hi-rate.wav");
        write_wav(&path, &sine(32_000, 32_000, 0.5), 1, 32_000)?;

        let chunks = AudioChunks::open(&path, 300.0, false)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples.len(), 16_000);
        Ok(())
    }

    #[test]
    fn test_resample_is_aligned_with_input() -> Result<()> {
        let input = sine(32_000, 32_000, 0.5);
        let expected = sine(16_000, SAMPLE_RATE, 0.5);

        let output = resample_audio(&input, 32_000)?;
        assert_eq!(output.len(), expected.len());
        let worst = output[2_000..14_000]
            .iter()
            .zip(&expected[2_000..14_000])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(worst < 0.05, "worst deviation {}", worst);
        Ok(())
    }

    #[test]
    fn test_unsupported_wav_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("float.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec)?;
        writer.write_sample(0.5f32)?;
        writer.finalize()?;

        assert!(AudioChunks::open(&path, 300.0, false).is_err());
        Ok(())
    }

    #[test]
    fn test_denoise_keeps_length_and_level() {
        let input = tone(8_192, 0.4);
        let output = spectral_noise_reduction(&input, 1024, 0.75, 0.5);
        assert_eq!(output.len(), input.len());
        assert!((peak(&output) - peak(&input)).abs() < 1e-3);
    }

    #[test]
    fn test_chunk_frames_has_floor() {
        assert_eq!(chunk_frames(300.0, SAMPLE_RATE), 4_800_000);
        assert_eq!(chunk_frames(0.01, SAMPLE_RATE), SAMPLE_RATE as usize);
        assert_eq!(chunk_frames(2.0, 44_100), 88_200);
    }

    #[tokio::test]
    async fn test_extract_missing_source_is_fatal() {
        let result = extract_audio(Path::new("/nonexistent/video.mp4"), Path::new("/tmp/out.wav")).await;
        assert!(matches!(result, Err(PipelineError::Fatal(_))));
    }
}
