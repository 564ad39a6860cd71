use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{error, info};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::{self, ModelHandle};

pub type ModelLoader = Box<dyn Fn() -> anyhow::Result<ModelHandle> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModelStatus
{
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
    Failed = 3,
}

impl ModelStatus
{
    fn from_u8(value: u8) -> Self
    {
        match value {
            1 => ModelStatus::Loading,
            2 => ModelStatus::Ready,
            3 => ModelStatus::Failed,
            _ => ModelStatus::Uninitialized,
        }
    }
}

impl fmt::Display for ModelStatus
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            ModelStatus::Uninitialized => "not loaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Ready => "ready",
            ModelStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum Slot
{
    Empty,
    Ready(ModelHandle),
    Failed(String),
}

/// Owns the process's one embedding model.
///
/// The slot mutex is held for the entire load, so callers that arrive while a
/// load is in flight block on it and then see that load's outcome instead of
/// starting their own. Once Ready the handle never changes; it is handed out
/// as a shared, read-only `Arc`.
///
/// A failed load is not retried in the background. The next caller that did
/// not wait on the failed attempt tries once more.
pub struct ModelProvider
{
    loader: ModelLoader,
    slot: Mutex<Slot>,
    status: AtomicU8,
    completed_loads: AtomicU64,
}

impl ModelProvider
{
    pub fn new(loader: ModelLoader) -> Self
    {
        ModelProvider {
            loader,
            slot: Mutex::new(Slot::Empty),
            status: AtomicU8::new(ModelStatus::Uninitialized as u8),
            completed_loads: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: ModelConfig) -> Self
    {
        Self::new(Box::new(move || model::load_model(&config)))
    }

    /// Returns the ready model, loading it first if needed.
    pub fn ensure_ready(&self) -> Result<ModelHandle>
    {
        let seen_loads = self.completed_loads.load(Ordering::Acquire);
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        match &*slot {
            Slot::Ready(model) => return Ok(model.clone()),
            Slot::Failed(message) if self.completed_loads.load(Ordering::Acquire) > seen_loads => {
                return Err(Error::ModelLoad(message.clone()));
            },
            _ => {},
        }

        self.set_status(ModelStatus::Loading);
        info!("Loading embedding model...");
        let now = Instant::now();
        let result = (self.loader)();

        let outcome = match result {
            Ok(model) => {
                info!("Model loaded in {:?}", now.elapsed());
                *slot = Slot::Ready(model.clone());
                self.set_status(ModelStatus::Ready);
                Ok(model)
            },
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Failed to load model: {}", message);
                *slot = Slot::Failed(message.clone());
                self.set_status(ModelStatus::Failed);
                Err(Error::ModelLoad(message))
            }
        };
        self.completed_loads.fetch_add(1, Ordering::AcqRel);

        outcome
    }

    /// Never blocks and never starts a load.
    pub fn status(&self) -> ModelStatus
    {
        ModelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ModelStatus)
    {
        self.status.store(status as u8, Ordering::Release);
    }
}
