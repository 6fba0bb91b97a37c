//! Single active model handle.
//!
//! The registry owns the one slot that may hold a loaded communicator and
//! the mutex that serializes everything touching it: lazy construction,
//! reload, and every generation call. Acquiring the slot IS acquiring the
//! generation lock; concurrent requests queue here instead of fanning out
//! into an inference engine that cannot run two generations at once.

use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::llm::communicator::{build_communicator, Communicator};
use crate::{loader, log_info};

pub type ModelSlot = Arc<Mutex<Option<Box<dyn Communicator>>>>;
pub type ModelGuard = OwnedMutexGuard<Option<Box<dyn Communicator>>>;

pub struct ModelRegistry {
    config: RwLock<AppConfig>,
    slot: ModelSlot,
}

impl ModelRegistry {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: RwLock::new(config),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> AppConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Acquire the model slot, loading the model first if the slot is empty.
    /// The returned guard is the exclusivity lock: hold it for as long as the
    /// generation (or stream) runs.
    ///
    /// Construction happens under the same lock the check does, so two
    /// concurrent first callers cannot both load.
    pub async fn acquire(&self) -> Result<ModelGuard, GatewayError> {
        let mut guard = self.slot.clone().lock_owned().await;

        if guard.is_none() {
            let config = self.config();
            log_info!("Initializing model: {}", config.model_label());
            let communicator = tokio::task::spawn_blocking(move || {
                // Fetch-on-demand runs before the handle is constructed.
                let model_path = loader::ensure_model(&config)?;
                build_communicator(&config, &model_path)
            })
            .await
            .map_err(|e| GatewayError::Inference(format!("model load task failed: {e}")))??;
            *guard = Some(communicator);
        }

        Ok(guard)
    }

    /// Drop the active handle. The next `acquire` rebuilds from the current
    /// configuration.
    pub async fn pop(&self) {
        let mut guard = self.slot.lock().await;
        if guard.take().is_some() {
            log_info!("Model handle released");
        }
    }

    /// Swap configuration and release the old handle; the replacement loads
    /// lazily on the next `acquire`.
    pub async fn reload(&self, config: AppConfig) {
        {
            let mut current = self.config.write().expect("config lock poisoned");
            *current = config;
        }
        self.pop().await;
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Registry primed with an already-built communicator; generation tests
    /// use this to avoid touching a real model.
    #[cfg(test)]
    pub fn with_communicator(config: AppConfig, communicator: Box<dyn Communicator>) -> Self {
        Self {
            config: RwLock::new(config),
            slot: Arc::new(Mutex::new(Some(communicator))),
        }
    }
}
