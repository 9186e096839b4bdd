//! Lazily loaded model table with single-flight loading and failure memory.
//!
//! Every configured id owns one entry. The first `resolve` for an id performs the load while
//! holding that entry's load lock; concurrent callers for the same id wait on the lock and then
//! observe the settled outcome instead of loading again. Different ids load independently. A
//! failed load is remembered and returned to every later caller until [`ModelRegistry::reload`]
//! starts a new attempt.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use log::{error, info, warn};

use medsight_utils::config::ServiceSettings;

use crate::engine::{LoadState, ModelDescriptor, ModelHandle, ModelKind, ModelLoader};
use crate::error::RegistryError;

#[derive(Debug)]
struct EntryStatus {
    state: LoadState,
    attempts: u32,
    handle: Option<Arc<ModelHandle>>,
    failure: Option<String>,
}

struct Entry {
    id: String,
    kind: ModelKind,
    weights: PathBuf,
    status: RwLock<EntryStatus>,
    load_lock: Mutex<()>,
}

type Outcome = Result<Arc<ModelHandle>, RegistryError>;

impl Entry {
    fn new(id: String, kind: ModelKind, weights: PathBuf) -> Self {
        Self {
            id,
            kind,
            weights,
            status: RwLock::new(EntryStatus {
                state: LoadState::Unloaded,
                attempts: 0,
                handle: None,
                failure: None,
            }),
            load_lock: Mutex::new(()),
        }
    }

    fn descriptor(&self) -> ModelDescriptor {
        let status = self.status.read().unwrap_or_else(|p| p.into_inner());
        ModelDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            weights_location: self.weights.clone(),
            load_state: status.state,
            attempts: status.attempts,
        }
    }

    /// Outcome of the current attempt, or `None` when no attempt has settled yet.
    fn settled(&self) -> Option<Outcome> {
        let status = self.status.read().unwrap_or_else(|p| p.into_inner());
        match status.state {
            LoadState::Ready => status.handle.clone().map(Ok),
            LoadState::Failed => Some(Err(RegistryError::LoadFailed {
                model_id: self.id.clone(),
                reason: status
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown load error".to_string()),
            })),
            LoadState::Unloaded | LoadState::Loading => None,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut EntryStatus)) {
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        apply(&mut status);
    }

    fn lock_load(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Owns every configured model and the loader that materializes them.
pub struct ModelRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    loader: Arc<dyn ModelLoader>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.list_available())
            .finish()
    }
}

impl ModelRegistry {
    /// Build a registry from `(id, kind, weights)` triples. Later duplicates of an id are ignored.
    pub fn new<I>(models: I, loader: Arc<dyn ModelLoader>) -> Self
    where
        I: IntoIterator<Item = (String, ModelKind, PathBuf)>,
    {
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for (id, kind, weights) in models {
            if index.contains_key(&id) {
                warn!("ignoring duplicate model id '{id}'");
                continue;
            }
            index.insert(id.clone(), entries.len());
            entries.push(Entry::new(id, kind, weights));
        }
        Self {
            entries,
            index,
            loader,
        }
    }

    pub fn from_settings(settings: &ServiceSettings, loader: Arc<dyn ModelLoader>) -> Self {
        Self::new(
            settings
                .models
                .iter()
                .map(|m| (m.id.clone(), m.kind, settings.weights_path(m))),
            loader,
        )
    }

    fn entry(&self, id: &str) -> Result<&Entry, RegistryError> {
        self.index
            .get(id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Return the loaded model for `id`, loading it on first use.
    ///
    /// Unknown ids fail with [`RegistryError::NotFound`] without touching any entry. A failed
    /// load is reported again on every call until [`reload`](Self::reload).
    pub fn resolve(&self, id: &str) -> Result<Arc<ModelHandle>, RegistryError> {
        let entry = self.entry(id)?;
        if let Some(outcome) = entry.settled() {
            return outcome;
        }
        let _load = entry.lock_load();
        // Another caller may have settled the entry while we waited for the lock.
        if let Some(outcome) = entry.settled() {
            return outcome;
        }
        self.load_entry(entry)
    }

    /// Start a new load attempt for a failed (or never loaded) model.
    ///
    /// A model that is already ready is returned as is.
    pub fn reload(&self, id: &str) -> Result<Arc<ModelHandle>, RegistryError> {
        let entry = self.entry(id)?;
        let _load = entry.lock_load();
        if let Some(Ok(handle)) = entry.settled() {
            return Ok(handle);
        }
        info!("reloading model '{id}'");
        self.load_entry(entry)
    }

    /// Snapshot of every configured model in configuration order.
    pub fn list_available(&self) -> Vec<ModelDescriptor> {
        self.entries.iter().map(Entry::descriptor).collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<ModelDescriptor> {
        self.entry(id).ok().map(Entry::descriptor)
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.descriptor(id)
            .is_some_and(|d| d.load_state == LoadState::Ready)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Load every configured model now. Returns the number that ended up ready.
    pub fn preload_all(&self) -> usize {
        let mut ready = 0;
        for entry in &self.entries {
            match self.resolve(&entry.id) {
                Ok(_) => ready += 1,
                Err(err) => warn!("preload skipped: {err}"),
            }
        }
        info!("preloaded {ready}/{} models", self.entries.len());
        ready
    }

    /// Perform one load attempt. Callers must hold the entry's load lock.
    fn load_entry(&self, entry: &Entry) -> Outcome {
        entry.update(|status| {
            status.state = LoadState::Loading;
            status.attempts += 1;
            status.failure = None;
            status.handle = None;
        });
        let descriptor = entry.descriptor();

        let loaded = catch_unwind(AssertUnwindSafe(|| self.loader.load(&descriptor)))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "loader panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });

        match loaded {
            Ok(engine) if engine.kind() != entry.kind => {
                let reason = format!(
                    "loader produced a {} engine for a {} model",
                    engine.kind(),
                    entry.kind
                );
                self.record_failure(entry, reason)
            }
            Ok(engine) => {
                let handle = Arc::new(ModelHandle::new(entry.id.clone(), engine));
                entry.update(|status| {
                    status.state = LoadState::Ready;
                    status.handle = Some(Arc::clone(&handle));
                });
                info!(
                    "model '{}' ready (attempt {})",
                    entry.id, descriptor.attempts
                );
                Ok(handle)
            }
            Err(err) => self.record_failure(entry, format!("{err:#}")),
        }
    }

    fn record_failure(&self, entry: &Entry, reason: String) -> Outcome {
        error!("failed to load model '{}': {reason}", entry.id);
        entry.update(|status| {
            status.state = LoadState::Failed;
            status.failure = Some(reason.clone());
        });
        Err(RegistryError::LoadFailed {
            model_id: entry.id.clone(),
            reason,
        })
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
