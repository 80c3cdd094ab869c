use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::model::DevicePreference;
use crate::schedule::types::Stage;

const DEFAULT_DATABASE_URL: &str = "sqlite://./chapter_data/database/storage.db?mode=rwc";
const DEFAULT_WORK_DIR: &str = "./chapter_data/work/";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7200";
const DEFAULT_ASR_URL: &str = "http://127.0.0.1:8000/v1";
const DEFAULT_LLM_URL: &str = "http://127.0.0.1:11434/v1";

/// Reads `key` from the process environment, then from `.env`.
pub fn env_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

/// Parses four comma separated numbers, one per pipeline stage.
fn parse_per_stage(raw: &str) -> Result<[f64; 4]> {
    let values = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("expected four comma separated numbers, got {:?}", raw))?;
    let values: [f64; 4] = values
        .try_into()
        .map_err(|v: Vec<f64>| anyhow!("expected four values, got {}", v.len()))?;
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(anyhow!("per-stage values must be non-negative: {:?}", raw));
    }
    Ok(values)
}

/// Relative weight of each stage in the overall job percentage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageWeights([f64; 4]);

impl StageWeights {
    pub fn new(weights: [f64; 4]) -> Result<Self> {
        let total: f64 = weights.iter().sum();
        if !weights.iter().all(|w| w.is_finite() && *w >= 0.0) || total <= 0.0 {
            return Err(anyhow!("stage weights must be non-negative with a positive sum"));
        }
        Ok(Self(weights.map(|w| w / total)))
    }

    pub fn weight(&self, stage: Stage) -> f64 {
        self.0[stage.index()]
    }

    /// Overall percentage for `fraction` (0..=1) of `stage`, counting every
    /// earlier stage as finished.
    pub fn overall(&self, stage: Stage, fraction: f64) -> f64 {
        let finished: f64 = self.0[..stage.index()].iter().sum();
        let value = (finished + self.weight(stage) * fraction.clamp(0.0, 1.0)) * 100.0;
        value.min(100.0)
    }
}

impl Default for StageWeights {
    fn default() -> Self {
        Self([0.1, 0.5, 0.3, 0.1])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts([Duration; 4]);

impl StageTimeouts {
    pub fn new(secs: [f64; 4]) -> Self {
        Self(secs.map(Duration::from_secs_f64))
    }

    pub fn uniform(timeout: Duration) -> Self {
        Self([timeout; 4])
    }

    pub fn for_stage(&self, stage: Stage) -> Duration {
        self.0[stage.index()]
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::new([600.0, 3600.0, 900.0, 60.0])
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub work_dir: PathBuf,
    pub log_dir: String,
    pub bind_addr: SocketAddr,
    pub worker_pool_size: usize,
    pub stage_weights: StageWeights,
    pub stage_timeouts: StageTimeouts,
    pub max_stage_retries: u32,
    pub retry_base_delay: Duration,
    pub progress_throttle: Duration,
    pub chunk_seconds: f64,
    pub device_preference: DevicePreference,
    pub whisper_model_path: Option<PathBuf>,
    pub asr_url: String,
    pub asr_model: String,
    pub asr_api_key: Option<String>,
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_context_tokens: usize,
    pub retention_days: i64,
    pub cleanup_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or("CHAPTER_BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid CHAPTER_BIND_ADDR: {}", bind_addr))?;

        let worker_pool_size = env_parse("CHAPTER_WORKERS", 2usize)?;
        if worker_pool_size == 0 {
            return Err(anyhow!("CHAPTER_WORKERS must be at least 1"));
        }

        let chunk_seconds = env_parse("CHAPTER_CHUNK_SECONDS", 300.0f64)?;
        if chunk_seconds <= 0.0 {
            return Err(anyhow!("CHAPTER_CHUNK_SECONDS must be positive"));
        }

        Ok(Self {
            database_url: env_or("CHAPTER_DATABASE_URL", DEFAULT_DATABASE_URL),
            work_dir: PathBuf::from(env_or("CHAPTER_WORK_DIR", DEFAULT_WORK_DIR)),
            log_dir: env_or("CHAPTER_LOG_DIR", DEFAULT_LOG_DIR),
            bind_addr,
            worker_pool_size,
            stage_weights: StageWeights::new(parse_per_stage(&env_or(
                "CHAPTER_STAGE_WEIGHTS",
                "10,50,30,10",
            ))?)?,
            stage_timeouts: StageTimeouts::new(parse_per_stage(&env_or(
                "CHAPTER_STAGE_TIMEOUTS",
                "600,3600,900,60",
            ))?),
            max_stage_retries: env_parse("CHAPTER_STAGE_RETRIES", 2u32)?,
            retry_base_delay: Duration::from_millis(env_parse("CHAPTER_RETRY_BASE_MS", 500u64)?),
            progress_throttle: Duration::from_millis(env_parse(
                "CHAPTER_PROGRESS_THROTTLE_MS",
                500u64,
            )?),
            chunk_seconds,
            device_preference: env_parse("CHAPTER_DEVICE", DevicePreference::Auto)?,
            whisper_model_path: env_var("CHAPTER_WHISPER_MODEL").map(PathBuf::from),
            asr_url: env_or("CHAPTER_ASR_URL", DEFAULT_ASR_URL),
            asr_model: env_or("CHAPTER_ASR_MODEL", "whisper-1"),
            asr_api_key: env_var("CHAPTER_ASR_API_KEY"),
            llm_url: env_or("CHAPTER_LLM_URL", DEFAULT_LLM_URL),
            llm_model: env_or("CHAPTER_LLM_MODEL", "llama3.1:8b"),
            llm_api_key: env_var("CHAPTER_LLM_API_KEY"),
            llm_context_tokens: env_parse("CHAPTER_LLM_CONTEXT_TOKENS", 4096usize)?,
            retention_days: env_parse("CHAPTER_RETENTION_DAYS", 30i64)?,
            cleanup_interval: Duration::from_secs(env_parse(
                "CHAPTER_CLEANUP_INTERVAL_SECS",
                3600u64,
            )?),
        })
    }
}
