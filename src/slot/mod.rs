//! Single-occupancy model slot.
//!
//! At most one local backend (file- or directory-backed) is resident at a
//! time. Loading always clears the slot before constructing the new
//! instance, so two live handles never coexist.
//!
//! ## Locking
//! - `transition` (async mutex) serializes load/unload so concurrent
//!   administrative calls cannot interleave.
//! - `state` (parking_lot `RwLock`) is held only for the instant of a
//!   state swap or read. Queries clone the `Arc` handle out of it and never
//!   wait for a load in progress.
//!
//! A handle captured by an in-flight query stays alive until that query
//! finishes, even if the slot is unloaded meanwhile. The slot's own
//! reference is dropped on the worker pool so freeing weights never stalls
//! the request loop.
//!
//! A load whose caller goes away mid-construction leaves the slot Empty
//! with `last_error` set to [`LOAD_CANCELLED`].

use crate::backends::{BackendFactory, BackendKind, LoadOptions, TextGenerator};
use crate::error::EngineError;
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// `last_error` after a load whose caller went away before it finished.
pub const LOAD_CANCELLED: &str = "load cancelled";

/// Readiness of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Empty,
    Loading,
    Ready,
}

/// Live state. The handle only exists inside `Ready`.
enum SlotState {
    Empty,
    Loading {
        kind: BackendKind,
        identifier: PathBuf,
    },
    Ready(ActiveModel),
}

/// A fully constructed backend occupying the slot.
#[derive(Clone)]
pub struct ActiveModel {
    pub kind: BackendKind,
    pub identifier: PathBuf,
    pub handle: Arc<dyn TextGenerator>,
    pub load_id: Uuid,
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModel")
            .field("kind", &self.kind)
            .field("identifier", &self.identifier)
            .field("engine", &self.handle.name())
            .field("load_id", &self.load_id)
            .finish()
    }
}

/// Read-only view of the slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub backend_kind: Option<BackendKind>,
    /// Empty when nothing is loaded.
    pub identifier: String,
    pub status: SlotStatus,
    pub load_id: Option<Uuid>,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Cause of the most recent failed load. The slot itself stays Empty.
    pub last_error: Option<String>,
}

/// Result of a successful load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReceipt {
    pub backend_kind: BackendKind,
    pub identifier: String,
    pub load_id: Uuid,
    /// Identifier of the model that was evicted to make room, if any.
    pub replaced: Option<String>,
}

/// Outcome of an unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadOutcome {
    /// A model was resident and has been released.
    Unloaded,
    /// The slot was already empty.
    AlreadyEmpty,
}

impl UnloadOutcome {
    /// Wire status string.
    pub fn as_status(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::AlreadyEmpty => "none",
        }
    }
}

/// Orchestrates load/unload/replace on the process-wide slot.
pub struct ModelSlotManager {
    state: RwLock<SlotState>,
    last_error: RwLock<Option<String>>,
    transition: tokio::sync::Mutex<()>,
    factory: Arc<dyn BackendFactory>,
    workers: WorkerPool,
}

impl ModelSlotManager {
    pub fn new(factory: Arc<dyn BackendFactory>, workers: WorkerPool) -> Self {
        Self {
            state: RwLock::new(SlotState::Empty),
            last_error: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
            factory,
            workers,
        }
    }

    /// Load a backend into the slot, evicting whatever was there.
    ///
    /// On failure the slot is left Empty (the previous model is already
    /// gone) and the cause is returned as a configuration error.
    pub async fn load(
        &self,
        identifier: PathBuf,
        kind: BackendKind,
        options: LoadOptions,
    ) -> Result<LoadReceipt, EngineError> {
        let _guard = self.transition.lock().await;

        let replaced = self.clear_locked().await;
        if let Some(ref previous) = replaced {
            tracing::info!(previous = %previous, "Evicted resident model before load");
        }

        *self.state.write() = SlotState::Loading {
            kind,
            identifier: identifier.clone(),
        };
        // Declared after `_guard` so it runs while the transition lock is still held.
        let mut pending = PendingLoad::new(self);
        tracing::info!(kind = %kind, path = %identifier.display(), "Loading model");

        let factory = Arc::clone(&self.factory);
        let path = identifier.clone();
        let built = self
            .workers
            .run(move || factory.create(kind, &path, &options))
            .await;

        pending.disarm();
        let handle: Arc<dyn TextGenerator> = match built {
            Ok(Ok(generator)) => Arc::from(generator),
            Ok(Err(e)) => return Err(self.fail_load(EngineError::configuration(&e))),
            Err(e) => return Err(self.fail_load(EngineError::Configuration(e.to_string()))),
        };

        let active = ActiveModel {
            kind,
            identifier: identifier.clone(),
            handle,
            load_id: Uuid::new_v4(),
            loaded_at: Utc::now(),
        };
        let receipt = LoadReceipt {
            backend_kind: kind,
            identifier: identifier.display().to_string(),
            load_id: active.load_id,
            replaced,
        };
        tracing::info!(
            kind = %kind,
            path = %identifier.display(),
            engine = active.handle.name(),
            "Model ready"
        );
        *self.state.write() = SlotState::Ready(active);
        *self.last_error.write() = None;
        Ok(receipt)
    }

    /// Release the resident model, if any. Never fails.
    pub async fn unload(&self) -> UnloadOutcome {
        let _guard = self.transition.lock().await;
        match self.clear_locked().await {
            Some(previous) => {
                tracing::info!(path = %previous, "Model unloaded");
                UnloadOutcome::Unloaded
            }
            None => UnloadOutcome::AlreadyEmpty,
        }
    }

    /// Consistent snapshot of the slot.
    pub fn status(&self) -> SlotSnapshot {
        let last_error = self.last_error.read().clone();
        match &*self.state.read() {
            SlotState::Empty => SlotSnapshot {
                backend_kind: None,
                identifier: String::new(),
                status: SlotStatus::Empty,
                load_id: None,
                loaded_at: None,
                last_error,
            },
            SlotState::Loading { kind, identifier } => SlotSnapshot {
                backend_kind: Some(*kind),
                identifier: identifier.display().to_string(),
                status: SlotStatus::Loading,
                load_id: None,
                loaded_at: None,
                last_error,
            },
            SlotState::Ready(active) => SlotSnapshot {
                backend_kind: Some(active.kind),
                identifier: active.identifier.display().to_string(),
                status: SlotStatus::Ready,
                load_id: Some(active.load_id),
                loaded_at: Some(active.loaded_at),
                last_error,
            },
        }
    }

    /// The resident model, if Ready. The returned handle stays valid for
    /// the caller even if the slot is swapped afterwards.
    pub fn active(&self) -> Option<ActiveModel> {
        match &*self.state.read() {
            SlotState::Ready(active) => Some(active.clone()),
            _ => None,
        }
    }

    /// Reset to Empty and return the identifier of the previous occupant.
    /// Caller must hold `transition`.
    async fn clear_locked(&self) -> Option<String> {
        let previous = std::mem::replace(&mut *self.state.write(), SlotState::Empty);
        match previous {
            SlotState::Ready(active) => {
                let identifier = active.identifier.display().to_string();
                self.release(active).await;
                Some(identifier)
            }
            SlotState::Loading { identifier, .. } => Some(identifier.display().to_string()),
            SlotState::Empty => None,
        }
    }

    /// Drop the slot's reference on a worker thread. Freeing model weights
    /// can take a while, and if a query still holds a clone the memory goes
    /// away when that query finishes instead.
    async fn release(&self, active: ActiveModel) {
        if let Err(e) = self.workers.run(move || drop(active)).await {
            tracing::warn!("Model teardown did not complete cleanly: {e}");
        }
    }

    fn fail_load(&self, err: EngineError) -> EngineError {
        *self.state.write() = SlotState::Empty;
        *self.last_error.write() = Some(err.to_string());
        tracing::warn!("Model load failed: {err}");
        err
    }
}

/// Puts the slot back to Empty if `load` is dropped mid-construction,
/// e.g. when the request times out or the client goes away. The worker
/// still finishes building and the result is discarded with it.
struct PendingLoad<'a> {
    slots: &'a ModelSlotManager,
    armed: bool,
}

impl<'a> PendingLoad<'a> {
    fn new(slots: &'a ModelSlotManager) -> Self {
        Self { slots, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cancelled = {
            let mut state = self.slots.state.write();
            match std::mem::replace(&mut *state, SlotState::Empty) {
                SlotState::Loading { identifier, .. } => Some(identifier),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(identifier) = cancelled {
            tracing::warn!(path = %identifier.display(), "Model load cancelled");
            *self.slots.last_error.write() = Some(LOAD_CANCELLED.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::GenerationRequest;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::ThreadId;
    use std::time::Duration;

    /// Counts live generator instances so tests can assert single occupancy.
    struct FakeGenerator {
        live: Arc<AtomicUsize>,
        dropped_on: Arc<parking_lot::Mutex<Vec<ThreadId>>>,
        label: String,
    }

    impl Drop for FakeGenerator {
        fn drop(&mut self) {
            self.dropped_on.lock().push(std::thread::current().id());
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl TextGenerator for FakeGenerator {
        fn generate(&self, request: &GenerationRequest<'_>) -> anyhow::Result<String> {
            Ok(format!("{}:{}", self.label, request.prompt))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    struct FakeFactory {
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        dropped_on: Arc<parking_lot::Mutex<Vec<ThreadId>>>,
        delay: Duration,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                dropped_on: Arc::new(parking_lot::Mutex::new(Vec::new())),
                delay: Duration::ZERO,
            }
        }
    }

    impl BackendFactory for FakeFactory {
        fn create(
            &self,
            kind: BackendKind,
            identifier: &Path,
            _options: &LoadOptions,
        ) -> anyhow::Result<Box<dyn TextGenerator>> {
            std::thread::sleep(self.delay);
            if identifier.to_string_lossy().contains("broken") {
                anyhow::bail!("unsupported model format: {}", identifier.display());
            }
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeGenerator {
                live: Arc::clone(&self.live),
                dropped_on: Arc::clone(&self.dropped_on),
                label: format!("{kind}"),
            }))
        }
    }

    fn manager_with(factory: FakeFactory) -> (ModelSlotManager, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let live = Arc::clone(&factory.live);
        let peak = Arc::clone(&factory.peak);
        (
            ModelSlotManager::new(Arc::new(factory), WorkerPool::new(4)),
            live,
            peak,
        )
    }

    #[tokio::test]
    async fn starts_empty() {
        let (slots, _, _) = manager_with(FakeFactory::new());
        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Empty);
        assert!(snap.backend_kind.is_none());
        assert!(snap.identifier.is_empty());
        assert!(slots.active().is_none());
    }

    #[tokio::test]
    async fn load_file_then_directory_swaps_occupant() {
        let (slots, live, peak) = manager_with(FakeFactory::new());

        slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();
        let receipt = slots
            .load("/models/dir_b".into(), BackendKind::Directory, LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt.replaced.as_deref(), Some("/models/a.gguf"));

        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Ready);
        assert_eq!(snap.backend_kind, Some(BackendKind::Directory));
        assert_eq!(snap.identifier, "/models/dir_b");
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unload_twice_reports_unloaded_then_none() {
        let (slots, live, _) = manager_with(FakeFactory::new());
        slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();

        assert_eq!(slots.unload().await, UnloadOutcome::Unloaded);
        assert_eq!(slots.status().status, SlotStatus::Empty);
        assert_eq!(slots.unload().await, UnloadOutcome::AlreadyEmpty);
        assert_eq!(slots.status().status, SlotStatus::Empty);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unload_on_fresh_slot_is_none() {
        let (slots, _, _) = manager_with(FakeFactory::new());
        let outcome = slots.unload().await;
        assert_eq!(outcome, UnloadOutcome::AlreadyEmpty);
        assert_eq!(outcome.as_status(), "none");
    }

    #[tokio::test]
    async fn failed_load_leaves_slot_empty_and_previous_released() {
        let (slots, live, _) = manager_with(FakeFactory::new());
        slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();

        let err = slots
            .load("/models/broken.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("unsupported model format"));

        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Empty);
        assert!(snap.backend_kind.is_none());
        assert!(snap.last_error.unwrap().contains("unsupported model format"));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_load_clears_last_error() {
        let (slots, _, _) = manager_with(FakeFactory::new());
        let _ = slots
            .load("/models/broken".into(), BackendKind::Directory, LoadOptions::default())
            .await;
        assert!(slots.status().last_error.is_some());

        slots
            .load("/models/ok".into(), BackendKind::Directory, LoadOptions::default())
            .await
            .unwrap();
        assert!(slots.status().last_error.is_none());
    }

    #[tokio::test]
    async fn reloading_same_identifier_still_swaps() {
        let (slots, live, _) = manager_with(FakeFactory::new());
        let first = slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();
        let second = slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();
        assert_ne!(first.load_id, second.load_id);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn captured_handle_outlives_unload() {
        let (slots, live, _) = manager_with(FakeFactory::new());
        slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();

        let captured = slots.active().unwrap();
        slots.unload().await;
        assert_eq!(slots.status().status, SlotStatus::Empty);

        // The in-flight call still completes on the old instance.
        let out = captured
            .handle
            .generate(&GenerationRequest {
                prompt: "hi",
                max_tokens: 4,
                stop: &[],
            })
            .unwrap();
        assert_eq!(out, "file:hi");
        drop(captured);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_never_overlap() {
        let mut factory = FakeFactory::new();
        factory.delay = Duration::from_millis(15);
        let (slots, live, peak) = manager_with(factory);
        let slots = Arc::new(slots);

        let mut handles = Vec::new();
        for i in 0..6 {
            let slots = Arc::clone(&slots);
            handles.push(tokio::spawn(async move {
                let kind = if i % 2 == 0 {
                    BackendKind::File
                } else {
                    BackendKind::Directory
                };
                slots
                    .load(format!("/models/m{i}").into(), kind, LoadOptions::default())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(slots.status().status, SlotStatus::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_during_load_reports_loading_without_handle() {
        let mut factory = FakeFactory::new();
        factory.delay = Duration::from_millis(200);
        let (slots, _, _) = manager_with(factory);
        let slots = Arc::new(slots);

        let loader = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                slots
                    .load("/models/slow".into(), BackendKind::Directory, LoadOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Loading);
        assert!(slots.active().is_none());

        loader.await.unwrap().unwrap();
        assert_eq!(slots.status().status, SlotStatus::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_load_leaves_slot_empty() {
        let mut factory = FakeFactory::new();
        factory.delay = Duration::from_millis(300);
        let (slots, live, _) = manager_with(factory);

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            slots.load("/models/slow".into(), BackendKind::Directory, LoadOptions::default()),
        )
        .await;
        assert!(attempt.is_err());

        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Empty);
        assert!(snap.backend_kind.is_none());
        assert_eq!(snap.last_error.as_deref(), Some(LOAD_CANCELLED));

        // The worker finishes building and the orphaned instance is dropped.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(slots.status().status, SlotStatus::Empty);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_accepts_load_after_abandoned_one() {
        let mut factory = FakeFactory::new();
        factory.delay = Duration::from_millis(100);
        let (slots, live, _) = manager_with(factory);

        let _ = tokio::time::timeout(
            Duration::from_millis(20),
            slots.load("/models/slow".into(), BackendKind::Directory, LoadOptions::default()),
        )
        .await;

        slots
            .load("/models/next.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();
        let snap = slots.status();
        assert_eq!(snap.status, SlotStatus::Ready);
        assert_eq!(snap.identifier, "/models/next.gguf");
        assert!(snap.last_error.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicted_model_is_freed_off_the_request_thread() {
        let factory = FakeFactory::new();
        let dropped_on = Arc::clone(&factory.dropped_on);
        let (slots, live, _) = manager_with(factory);
        let request_thread = std::thread::current().id();

        slots
            .load("/models/a.gguf".into(), BackendKind::File, LoadOptions::default())
            .await
            .unwrap();
        slots
            .load("/models/b".into(), BackendKind::Directory, LoadOptions::default())
            .await
            .unwrap();
        slots.unload().await;

        assert_eq!(live.load(Ordering::SeqCst), 0);
        let threads = dropped_on.lock().clone();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != request_thread));
    }
}
