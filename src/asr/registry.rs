use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::{AsrEngine, TranscribeResult};
use crate::error::{Result, SchedulerError};
use crate::schedule::scheduler::WorkerPool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub tier: usize,
    pub name: String,
    pub state: LoadState,
    pub max_concurrency: usize,
}

struct Tier {
    engine: Arc<dyn AsrEngine>,
    state: RwLock<LoadState>,
    // 同一时刻只允许一个加载
    load_gate: Mutex<()>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl Tier {
    fn settled(&self) -> Option<std::result::Result<(), String>> {
        match &*self.state.read() {
            LoadState::Ready => Some(Ok(())),
            LoadState::Failed(reason) => Some(Err(reason.clone())),
            LoadState::Unloaded | LoadState::Loading => None,
        }
    }
}

/// Backends in strict priority order, index 0 first.
///
/// Loads are lazy and memoized for the life of the registry: a tier that
/// failed to load stays `Failed` and is never attempted again. Ready tiers
/// are shared by all jobs, with each tier's concurrent calls bounded by its
/// own semaphore and all blocking work going through the worker pool.
pub struct BackendRegistry {
    tiers: Vec<Tier>,
    pool: WorkerPool,
}

impl BackendRegistry {
    pub fn new(engines: Vec<Arc<dyn AsrEngine>>, pool: WorkerPool) -> Self {
        let tiers = engines
            .into_iter()
            .map(|engine| {
                let concurrency = engine.max_concurrency().max(1);
                Tier {
                    engine,
                    state: RwLock::new(LoadState::Unloaded),
                    load_gate: Mutex::new(()),
                    permits: Arc::new(Semaphore::new(concurrency)),
                    concurrency,
                }
            })
            .collect();
        Self { tiers, pool }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.tiers.get(index).map(|tier| tier.engine.name())
    }

    pub fn state(&self, index: usize) -> Option<LoadState> {
        self.tiers.get(index).map(|tier| tier.state.read().clone())
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| BackendStatus {
                tier: index,
                name: tier.engine.name().to_string(),
                state: tier.state.read().clone(),
                max_concurrency: tier.concurrency,
            })
            .collect()
    }

    /// Load tier `index` unless its outcome is already known. The error is
    /// the recorded load failure reason.
    pub async fn ensure_loaded(&self, index: usize) -> std::result::Result<(), String> {
        let tier = self
            .tiers
            .get(index)
            .ok_or_else(|| format!("no backend tier {}", index))?;
        if let Some(outcome) = tier.settled() {
            return outcome;
        }

        let _gate = tier.load_gate.lock().await;
        if let Some(outcome) = tier.settled() {
            return outcome;
        }

        *tier.state.write() = LoadState::Loading;
        let engine = tier.engine.clone();
        let name = engine.name().to_string();
        info!("Loading backend tier {} ({})", index, name);

        let outcome = match self.pool.run(&format!("load {}", name), move || engine.load()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) => Err(e.to_string()),
        };

        match &outcome {
            Ok(()) => {
                info!("Backend tier {} ({}) ready", index, name);
                *tier.state.write() = LoadState::Ready;
            }
            Err(reason) => {
                warn!("Backend tier {} ({}) failed to load: {}", index, name, reason);
                *tier.state.write() = LoadState::Failed(reason.clone());
            }
        }
        outcome
    }

    /// Run one transcription on tier `index`. Runtime failures, including a
    /// panicking backend, come back as `BackendInvocationFailure`.
    pub async fn invoke(&self, index: usize, audio: &Path, device: Option<u32>) -> Result<TranscribeResult> {
        let tier = self
            .tiers
            .get(index)
            .ok_or_else(|| SchedulerError::Internal(format!("no backend tier {}", index)))?;
        let name = tier.engine.name().to_string();

        let _permit = tier
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Internal(format!("backend {} closed", name)))?;

        // a cleanup pass may have unloaded the tier while we queued
        self.ensure_loaded(index)
            .await
            .map_err(|reason| SchedulerError::backend_failure(&name, reason))?;

        let engine = tier.engine.clone();
        let audio = audio.to_path_buf();
        match self.pool.run(&name, move || engine.transcribe(&audio, device)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(SchedulerError::backend_failure(&name, format!("{:#}", e))),
            Err(e) => Err(SchedulerError::backend_failure(&name, e)),
        }
    }

    /// Unload every idle Ready tier back to `Unloaded`. Tiers with calls in
    /// flight or a load in progress are skipped. Failed tiers stay failed.
    pub fn release_ready(&self) -> Vec<String> {
        let mut released = Vec::new();
        for tier in &self.tiers {
            if *tier.state.read() != LoadState::Ready {
                continue;
            }
            let Ok(_gate) = tier.load_gate.try_lock() else {
                continue;
            };
            let Ok(_idle) = tier.permits.try_acquire_many(tier.concurrency as u32) else {
                debug!("Backend {} busy, keeping it loaded", tier.engine.name());
                continue;
            };
            tier.engine.unload();
            *tier.state.write() = LoadState::Unloaded;
            released.push(tier.engine.name().to_string());
        }
        if !released.is_empty() {
            info!("Released backends: {}", released.join(", "));
        }
        released
    }
}
