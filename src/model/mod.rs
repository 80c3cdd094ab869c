//! Model resource management.
//!
//! The transcription and chapter-generation capabilities are loaded lazily by
//! a [`ModelLoader`] and cached by the [`ModelManager`]. Stages borrow a
//! [`ModelHandle`] for the duration of one call; the handle holds a lease that
//! keeps the model from being unloaded while it is in use.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asr::AsrEngine;
use crate::error::PipelineError;
use crate::llm::ChapterGenerator;

mod manager;

pub use manager::{ModelManager, ModelStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Transcription,
    ChapterGeneration,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Transcription, ModelKind::ChapterGeneration];
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelKind::Transcription => f.write_str("transcription"),
            ModelKind::ChapterGeneration => f.write_str("chapter generation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cuda,
    Metal,
    Cpu,
}

impl Device {
    pub fn is_accelerated(self) -> bool {
        !matches!(self, Device::Cpu)
    }

    /// Resolves a preference to a concrete device. `Auto` picks the
    /// accelerated backend this binary was built with, if any.
    pub fn resolve(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Device::Cuda,
            DevicePreference::Metal => Device::Metal,
            DevicePreference::Auto => {
                if cfg!(feature = "cuda") {
                    Device::Cuda
                } else if cfg!(feature = "metal") {
                    Device::Metal
                } else {
                    Device::Cpu
                }
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cuda => f.write_str("cuda"),
            Device::Metal => f.write_str("metal"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(anyhow!("unknown device preference: {}", other)),
        }
    }
}

/// A loaded capability provider.
#[derive(Clone)]
pub enum LoadedModel {
    Transcriber(Arc<dyn AsrEngine>),
    Generator(Arc<dyn ChapterGenerator>),
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadedModel::Transcriber(_) => f.write_str("LoadedModel::Transcriber"),
            LoadedModel::Generator(_) => f.write_str("LoadedModel::Generator"),
        }
    }
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn kind(&self) -> ModelKind;
    async fn load(&self, device: Device) -> Result<LoadedModel, PipelineError>;
}

/// Decrements the model's reference count when dropped.
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ModelHandle {
    kind: ModelKind,
    device: Device,
    loaded_at: DateTime<Utc>,
    model: LoadedModel,
    lease: Lease,
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Number of live handles for this model, this one included.
    pub fn ref_count(&self) -> usize {
        self.lease.0.load(Ordering::SeqCst)
    }

    pub fn transcriber(&self) -> Result<Arc<dyn AsrEngine>, PipelineError> {
        match &self.model {
            LoadedModel::Transcriber(engine) => Ok(engine.clone()),
            LoadedModel::Generator(_) => Err(PipelineError::model_load(
                self.kind,
                "loader returned a chapter generator for the transcription slot",
            )),
        }
    }

    pub fn generator(&self) -> Result<Arc<dyn ChapterGenerator>, PipelineError> {
        match &self.model {
            LoadedModel::Generator(generator) => Ok(generator.clone()),
            LoadedModel::Transcriber(_) => Err(PipelineError::model_load(
                self.kind,
                "loader returned a transcriber for the chapter generation slot",
            )),
        }
    }
}
