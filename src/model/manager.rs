use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Device, DevicePreference, Lease, LoadedModel, ModelHandle, ModelKind, ModelLoader};
use crate::error::PipelineError;

struct Slot {
    model: LoadedModel,
    device: Device,
    loaded_at: DateTime<Utc>,
    refs: Arc<AtomicUsize>,
}

impl Slot {
    fn handle(&self, kind: ModelKind) -> ModelHandle {
        ModelHandle {
            kind,
            device: self.device,
            loaded_at: self.loaded_at,
            model: self.model.clone(),
            lease: Lease::acquire(&self.refs),
        }
    }

    fn in_use(&self) -> bool {
        self.refs.load(Ordering::SeqCst) > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub kind: ModelKind,
    pub loaded: bool,
    pub device: Option<Device>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub ref_count: usize,
}

/// Owns the cached capability providers.
///
/// Each kind has its own async mutex; it is held across a load so two jobs
/// never load the same model at once. Once loaded, handles are handed out
/// under a short lock and used concurrently.
pub struct ModelManager {
    loaders: HashMap<ModelKind, Arc<dyn ModelLoader>>,
    slots: HashMap<ModelKind, Mutex<Option<Slot>>>,
    preference: DevicePreference,
}

impl ModelManager {
    pub fn new(preference: DevicePreference) -> Self {
        Self {
            loaders: HashMap::new(),
            slots: ModelKind::ALL
                .iter()
                .map(|kind| (*kind, Mutex::new(None)))
                .collect(),
            preference,
        }
    }

    pub fn register_loader(&mut self, loader: Arc<dyn ModelLoader>) {
        let kind = loader.kind();
        info!("Registering model loader for {}", kind);
        self.loaders.insert(kind, loader);
    }

    /// Device a fresh load would target.
    pub fn preferred_device(&self) -> Device {
        Device::resolve(self.preference)
    }

    pub async fn acquire(&self, kind: ModelKind) -> Result<ModelHandle, PipelineError> {
        self.acquire_on(kind, self.preferred_device()).await
    }

    /// Like [`acquire`](Self::acquire), but a failed load on an accelerated
    /// device is retried once on the CPU.
    pub async fn acquire_with_fallback(&self, kind: ModelKind) -> Result<ModelHandle, PipelineError> {
        let device = self.preferred_device();
        match self.acquire_on(kind, device).await {
            Err(PipelineError::ModelLoad { reason, .. }) if device.is_accelerated() => {
                warn!(
                    model = %kind,
                    device = %device,
                    "Model load failed ({}), falling back to cpu",
                    reason
                );
                self.acquire_on(kind, Device::Cpu).await
            }
            other => other,
        }
    }

    async fn acquire_on(&self, kind: ModelKind, device: Device) -> Result<ModelHandle, PipelineError> {
        let slot = self
            .slots
            .get(&kind)
            .ok_or_else(|| PipelineError::model_load(kind, "no slot for model kind"))?;
        let mut slot = slot.lock().await;

        if let Some(loaded) = slot.as_ref() {
            return Ok(loaded.handle(kind));
        }

        let loader = self
            .loaders
            .get(&kind)
            .ok_or_else(|| PipelineError::model_load(kind, "no loader registered"))?;

        info!(model = %kind, device = %device, "Loading model");
        let model = match loader.load(device).await {
            Ok(model) => model,
            Err(PipelineError::ModelLoad { reason, .. }) => {
                return Err(PipelineError::model_load(kind, reason))
            }
            Err(e) => return Err(PipelineError::model_load(kind, e.to_string())),
        };

        let loaded = Slot {
            model,
            device,
            loaded_at: Utc::now(),
            refs: Arc::new(AtomicUsize::new(0)),
        };
        let handle = loaded.handle(kind);
        *slot = Some(loaded);
        info!(model = %kind, device = %device, "Model loaded");
        Ok(handle)
    }

    /// Unloads `kind` if nothing holds a handle to it. Returns whether a
    /// model was unloaded.
    pub async fn release(&self, kind: ModelKind) -> bool {
        let Some(slot) = self.slots.get(&kind) else {
            return false;
        };
        let mut slot = slot.lock().await;
        match slot.as_ref() {
            Some(loaded) if loaded.in_use() => {
                warn!(model = %kind, "Model is in use, not unloading");
                false
            }
            Some(_) => {
                *slot = None;
                info!(model = %kind, "Model unloaded");
                true
            }
            None => false,
        }
    }

    pub async fn unload_idle(&self) -> Vec<ModelKind> {
        let mut unloaded = Vec::new();
        for kind in ModelKind::ALL {
            if self.release(kind).await {
                unloaded.push(kind);
            }
        }
        unloaded
    }

    pub async fn is_loaded(&self, kind: ModelKind) -> bool {
        match self.slots.get(&kind) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    pub async fn status(&self) -> Vec<ModelStatus> {
        let mut statuses = Vec::with_capacity(ModelKind::ALL.len());
        for kind in ModelKind::ALL {
            let status = match self.slots.get(&kind) {
                Some(slot) => {
                    let slot = slot.lock().await;
                    match slot.as_ref() {
                        Some(loaded) => ModelStatus {
                            kind,
                            loaded: true,
                            device: Some(loaded.device),
                            loaded_at: Some(loaded.loaded_at),
                            ref_count: loaded.refs.load(Ordering::SeqCst),
                        },
                        None => ModelStatus {
                            kind,
                            loaded: false,
                            device: None,
                            loaded_at: None,
                            ref_count: 0,
                        },
                    }
                }
                None => continue,
            };
            statuses.push(status);
        }
        statuses
    }
}
