//! Model registry — descriptors, load states, and the download pump.
//!
//! The registry owns every [`ModelDescriptor`] and is the only writer of
//! their load states.  A `load_model` call hands the engine's prepare
//! stream to a background pump task; the pump is the sole consumer of that
//! stream and applies events to the registry in arrival order.  At most one
//! load runs per registry instance; a load for a second model is rejected
//! with `Busy` while the first is in flight.
//!
//! Loads are epoch-tagged: the pump captures the epoch current at start and
//! every event it applies is checked against the registry's live epoch, so
//! a stale pump (superseded after a failure retry) can never write.
//!
//! Selection is intentionally *not* performed here — switching the active
//! model is gated on session state, which the orchestrator owns (see
//! `session`).  The registry only enforces that a selected model is
//! `Ready`.

pub mod catalog;

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, PrepareEvent};
use crate::error::AppError;

// ── Descriptors ──────────────────────────────────────────────────────────────

/// Where a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOrigin {
    BuiltIn,
    UserAdded,
}

/// Lifecycle of a model's weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Downloading,
    Ready,
    Failed,
}

/// A known model.  Owned exclusively by the registry; callers get clones.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Unique id, also the display handle.
    pub id: String,
    /// Where the weights are fetched from (URL or path).
    pub source_locator: String,
    /// Runtime library / chat-template identifier the engine needs.
    pub library_locator: String,
    pub origin: ModelOrigin,
    pub load_state: LoadState,
}

impl ModelDescriptor {
    pub fn built_in(
        id: impl Into<String>,
        source_locator: impl Into<String>,
        library_locator: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_locator: source_locator.into(),
            library_locator: library_locator.into(),
            origin: ModelOrigin::BuiltIn,
            load_state: LoadState::Unloaded,
        }
    }

    pub fn user_added(
        id: impl Into<String>,
        source_locator: impl Into<String>,
        library_locator: impl Into<String>,
    ) -> Self {
        Self {
            origin: ModelOrigin::UserAdded,
            ..Self::built_in(id, source_locator, library_locator)
        }
    }
}

// ── Progress events ──────────────────────────────────────────────────────────

/// Download progress for one model load.
///
/// `bytes_loaded` is monotonically non-decreasing within one load.
/// `estimated_seconds_remaining` is advisory; absent or non-positive values
/// mean "unknown".
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub model_id: String,
    pub bytes_loaded: u64,
    pub bytes_total: Option<u64>,
    pub estimated_seconds_remaining: Option<f64>,
}

/// Event delivered to a `load_model` subscriber: progress events followed
/// by exactly one terminal `Ready` or `Failed`.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    Progress(DownloadProgress),
    Ready { model_id: String },
    Failed { model_id: String, message: String },
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Thread-safe model registry.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

struct RegistryInner {
    /// Built-ins first (catalog order), then user-added in addition order.
    models: Vec<ModelDescriptor>,
    selected: Option<String>,
    /// Model id currently `Downloading`, if any.
    loading: Option<String>,
    load_epoch: u64,
}

impl ModelRegistry {
    /// Registry seeded with the built-in catalog.
    pub fn with_builtin_catalog() -> Self {
        Self::with_models(catalog::builtin_models())
    }

    /// Registry over an explicit descriptor list (tests, custom catalogs).
    pub fn with_models(models: Vec<ModelDescriptor>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                models,
                selected: None,
                loading: None,
                load_epoch: 0,
            })),
        }
    }

    /// All descriptors: built-ins first, then user-added, each in addition
    /// order.
    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.lock().models.clone()
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.lock().models.iter().find(|m| m.id == id).cloned()
    }

    /// Register a user-added model.  The descriptor starts `Unloaded`
    /// regardless of what the caller passed.
    pub fn add_model(&self, descriptor: ModelDescriptor) -> Result<(), AppError> {
        for (field, value) in [
            ("id", &descriptor.id),
            ("source_locator", &descriptor.source_locator),
            ("library_locator", &descriptor.library_locator),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::InvalidInput(format!("model {field} must not be empty")));
            }
        }

        let mut inner = self.lock();
        if inner.models.iter().any(|m| m.id == descriptor.id) {
            return Err(AppError::DuplicateId(descriptor.id));
        }

        let descriptor = ModelDescriptor {
            origin: ModelOrigin::UserAdded,
            load_state: LoadState::Unloaded,
            ..descriptor
        };
        info!(model_id = %descriptor.id, "model added");
        inner.models.push(descriptor);
        Ok(())
    }

    /// Remove a user-added model.
    ///
    /// Fails with `NotFound` if absent, `InvalidInput` for built-ins, and
    /// `InUse` while the model is selected or mid-download.
    pub fn remove_model(&self, id: &str) -> Result<(), AppError> {
        let mut inner = self.lock();

        let model = inner
            .models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| AppError::NotFound(format!("model {id}")))?;

        if model.origin == ModelOrigin::BuiltIn {
            return Err(AppError::InvalidInput(format!("built-in model {id} cannot be removed")));
        }
        if inner.selected.as_deref() == Some(id) {
            return Err(AppError::InUse(format!("model {id} is the selected model")));
        }
        if inner.loading.as_deref() == Some(id) {
            return Err(AppError::InUse(format!("model {id} is downloading")));
        }

        inner.models.retain(|m| m.id != id);
        info!(model_id = %id, "model removed");
        Ok(())
    }

    /// Start loading a model, streaming progress to `events`.
    ///
    /// Returns immediately after the download pump is spawned; the
    /// subscriber receives `Progress` events culminating in exactly one
    /// `Ready` or `Failed`.  Fails with `NotFound` for unknown ids and
    /// `Busy` when a different model is mid-load.  Loading a model that is
    /// already `Ready` (or already being loaded) is a no-op success — the
    /// subscriber still gets its terminal `Ready` in the former case.
    pub fn load_model(
        &self,
        id: &str,
        engine: &Engine,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) -> Result<(), AppError> {
        let (descriptor, epoch) = {
            let mut inner = self.lock();

            let model = inner
                .models
                .iter()
                .find(|m| m.id == id)
                .ok_or_else(|| AppError::NotFound(format!("model {id}")))?
                .clone();

            if model.load_state == LoadState::Ready {
                debug!(model_id = %id, "load requested for ready model — no-op");
                let _ = events.send(LoadEvent::Ready { model_id: model.id });
                return Ok(());
            }

            match inner.loading.as_deref() {
                Some(other) if other != id => {
                    return Err(AppError::Busy(format!("load already in progress for {other}")));
                }
                Some(_) => {
                    debug!(model_id = %id, "load already in progress for this model — no-op");
                    return Ok(());
                }
                None => {}
            }

            inner.loading = Some(id.to_string());
            inner.load_epoch += 1;
            let epoch = inner.load_epoch;
            set_state(&mut inner, id, LoadState::Downloading);
            (model, epoch)
        };

        info!(model_id = %id, "model load started");
        let rx = engine.prepare(&descriptor);
        let registry = self.clone();
        let model_id = id.to_string();
        tokio::spawn(async move {
            registry.run_load_pump(model_id, epoch, rx, events).await;
        });
        Ok(())
    }

    /// Consume the engine's prepare stream and apply it to the registry.
    ///
    /// Sole consumer of `rx`; events apply in arrival order.  Every write
    /// is gated on the load epoch captured at start.
    async fn run_load_pump(
        &self,
        model_id: String,
        epoch: u64,
        mut rx: mpsc::UnboundedReceiver<PrepareEvent>,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) {
        let mut last_bytes = 0u64;
        let mut terminal_seen = false;

        while let Some(ev) = rx.recv().await {
            let mut inner = self.lock();
            if inner.load_epoch != epoch {
                debug!(model_id = %model_id, "stale load event dropped");
                return;
            }

            match ev {
                PrepareEvent::Progress { bytes_loaded, bytes_total, eta_seconds } => {
                    // Enforce the monotonicity guarantee even if the engine
                    // misreports.
                    last_bytes = last_bytes.max(bytes_loaded);
                    drop(inner);
                    let _ = events.send(LoadEvent::Progress(DownloadProgress {
                        model_id: model_id.clone(),
                        bytes_loaded: last_bytes,
                        bytes_total,
                        estimated_seconds_remaining: eta_seconds,
                    }));
                }
                PrepareEvent::Ready => {
                    set_state(&mut inner, &model_id, LoadState::Ready);
                    inner.loading = None;
                    drop(inner);
                    info!(model_id = %model_id, "model ready");
                    let _ = events.send(LoadEvent::Ready { model_id: model_id.clone() });
                    terminal_seen = true;
                    break;
                }
                PrepareEvent::Failed { message } => {
                    set_state(&mut inner, &model_id, LoadState::Failed);
                    inner.loading = None;
                    drop(inner);
                    warn!(model_id = %model_id, error = %message, "model load failed");
                    let _ = events.send(LoadEvent::Failed {
                        model_id: model_id.clone(),
                        message,
                    });
                    terminal_seen = true;
                    break;
                }
            }
        }

        if !terminal_seen {
            // The engine closed its stream without a terminal event.
            let mut inner = self.lock();
            if inner.load_epoch != epoch {
                return;
            }
            set_state(&mut inner, &model_id, LoadState::Failed);
            inner.loading = None;
            drop(inner);
            warn!(model_id = %model_id, "prepare stream closed without terminal event");
            let _ = events.send(LoadEvent::Failed {
                model_id,
                message: "engine closed the prepare stream".into(),
            });
        }
    }

    /// Make `id` the selected model.  Requires `Ready`.
    ///
    /// Session-state gating (no switching while streaming) is enforced by
    /// the orchestrator before it delegates here.
    pub fn select(&self, id: &str) -> Result<(), AppError> {
        let mut inner = self.lock();
        let model = inner
            .models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| AppError::NotFound(format!("model {id}")))?;

        if model.load_state != LoadState::Ready {
            return Err(AppError::ModelNotReady(format!("model {id} is not ready")));
        }
        inner.selected = Some(id.to_string());
        info!(model_id = %id, "model selected");
        Ok(())
    }

    pub fn selected_model(&self) -> Option<ModelDescriptor> {
        let inner = self.lock();
        let id = inner.selected.as_deref()?;
        inner.models.iter().find(|m| m.id == id).cloned()
    }

    /// The selected model, required `Ready` — the generation precondition.
    pub fn selected_ready(&self) -> Result<ModelDescriptor, AppError> {
        let model = self
            .selected_model()
            .ok_or_else(|| AppError::ModelNotReady("no model selected".into()))?;
        if model.load_state != LoadState::Ready {
            return Err(AppError::ModelNotReady(format!("model {} is not ready", model.id)));
        }
        Ok(model)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn set_state(inner: &mut RegistryInner, id: &str, state: LoadState) {
    if let Some(m) = inner.models.iter_mut().find(|m| m.id == id) {
        m.load_state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn registry() -> ModelRegistry {
        ModelRegistry::with_models(vec![ModelDescriptor::built_in(
            "base",
            "https://example.test/base.gguf",
            "llama-cpp/chatml",
        )])
    }

    fn mock_engine() -> Engine {
        Engine::Mock(MockEngine::scripted(Vec::<String>::new()))
    }

    /// Drain load events until the terminal one, returning it.
    async fn terminal(rx: &mut mpsc::UnboundedReceiver<LoadEvent>) -> LoadEvent {
        loop {
            match rx.recv().await.expect("load event stream ended early") {
                LoadEvent::Progress(_) => continue,
                terminal => return terminal,
            }
        }
    }

    #[test]
    fn add_duplicate_id_fails() {
        let reg = registry();
        reg.add_model(ModelDescriptor::user_added("m1", "https://x.test/a", "lib")).unwrap();
        let err = reg
            .add_model(ModelDescriptor::user_added("m1", "https://x.test/b", "lib"))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateId(_)));
    }

    #[test]
    fn add_rejects_blank_fields() {
        let reg = registry();
        for d in [
            ModelDescriptor::user_added("  ", "https://x.test/a", "lib"),
            ModelDescriptor::user_added("m1", "   ", "lib"),
            ModelDescriptor::user_added("m1", "https://x.test/a", ""),
        ] {
            assert!(matches!(reg.add_model(d), Err(AppError::InvalidInput(_))));
        }
    }

    #[test]
    fn list_keeps_builtins_first_then_addition_order() {
        let reg = registry();
        reg.add_model(ModelDescriptor::user_added("u1", "https://x.test/1", "lib")).unwrap();
        reg.add_model(ModelDescriptor::user_added("u2", "https://x.test/2", "lib")).unwrap();

        let ids: Vec<_> = reg.list_models().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["base", "u1", "u2"]);
    }

    #[test]
    fn added_models_start_unloaded_and_user_added() {
        let reg = registry();
        let mut d = ModelDescriptor::user_added("u1", "https://x.test/1", "lib");
        d.load_state = LoadState::Ready; // must be ignored
        reg.add_model(d).unwrap();

        let m = reg.get("u1").unwrap();
        assert_eq!(m.load_state, LoadState::Unloaded);
        assert_eq!(m.origin, ModelOrigin::UserAdded);
    }

    #[test]
    fn remove_unknown_fails_not_found() {
        assert!(matches!(registry().remove_model("ghost"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn remove_builtin_is_rejected() {
        assert!(matches!(registry().remove_model("base"), Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn load_then_select_then_remove_fails_in_use() {
        let reg = registry();
        reg.add_model(ModelDescriptor::user_added("m1", "https://x.test/1", "lib")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("m1", &mock_engine(), tx).unwrap();
        assert!(matches!(terminal(&mut rx).await, LoadEvent::Ready { .. }));

        reg.select("m1").unwrap();
        let err = reg.remove_model("m1").unwrap_err();
        assert!(matches!(err, AppError::InUse(_)));
    }

    #[tokio::test]
    async fn load_unknown_model_fails_not_found() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry().load_model("ghost", &mock_engine(), tx).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_transitions_through_downloading_to_ready() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("base", &mock_engine(), tx).unwrap();
        assert_eq!(reg.get("base").unwrap().load_state, LoadState::Downloading);

        let mut last = 0u64;
        let mut saw_progress = false;
        loop {
            match rx.recv().await.unwrap() {
                LoadEvent::Progress(p) => {
                    assert_eq!(p.model_id, "base");
                    assert!(p.bytes_loaded >= last);
                    last = p.bytes_loaded;
                    saw_progress = true;
                }
                LoadEvent::Ready { model_id } => {
                    assert_eq!(model_id, "base");
                    break;
                }
                LoadEvent::Failed { message, .. } => panic!("unexpected failure: {message}"),
            }
        }
        assert!(saw_progress);
        assert_eq!(reg.get("base").unwrap().load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn failed_prepare_marks_model_failed() {
        let reg = registry();
        let engine = Engine::Mock(
            MockEngine::scripted(Vec::<String>::new()).with_prepare_failure("404 not found"),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("base", &engine, tx).unwrap();
        match terminal(&mut rx).await {
            LoadEvent::Failed { message, .. } => assert!(message.contains("404")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(reg.get("base").unwrap().load_state, LoadState::Failed);

        // A failed load releases the single-load slot.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        reg.load_model("base", &mock_engine(), tx2).unwrap();
        assert!(matches!(terminal(&mut rx2).await, LoadEvent::Ready { .. }));
    }

    #[tokio::test]
    async fn concurrent_load_for_other_model_is_busy() {
        let reg = registry();
        reg.add_model(ModelDescriptor::user_added("m2", "https://x.test/2", "lib")).unwrap();

        let mock = MockEngine::scripted(Vec::<String>::new()).with_manual_prepare();
        let engine = Engine::Mock(mock.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("base", &engine, tx).unwrap();

        // Another model while the first download is in flight: rejected.
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let err = reg.load_model("m2", &engine, tx2).unwrap_err();
        assert!(matches!(err, AppError::Busy(_)));

        // Same model again: accepted as a no-op.
        let (tx3, _rx3) = mpsc::unbounded_channel();
        reg.load_model("base", &engine, tx3).unwrap();

        mock.emit_prepare(PrepareEvent::Ready);
        assert!(matches!(terminal(&mut rx).await, LoadEvent::Ready { .. }));

        // Slot released: the other model can load now.
        let (tx4, _rx4) = mpsc::unbounded_channel();
        reg.load_model("m2", &engine, tx4).unwrap();
    }

    #[tokio::test]
    async fn repeated_load_of_ready_model_is_idempotent() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("base", &mock_engine(), tx).unwrap();
        assert!(matches!(terminal(&mut rx).await, LoadEvent::Ready { .. }));

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        reg.load_model("base", &mock_engine(), tx2).unwrap();
        assert!(matches!(rx2.recv().await, Some(LoadEvent::Ready { .. })));
        assert_eq!(reg.get("base").unwrap().load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn prepare_stream_closing_early_is_a_failure() {
        let reg = registry();
        let mock = MockEngine::scripted(Vec::<String>::new()).with_manual_prepare();
        let engine = Engine::Mock(mock.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.load_model("base", &engine, tx).unwrap();

        // Drop the engine-side sender without a terminal event.
        mock.emit_prepare(PrepareEvent::Progress {
            bytes_loaded: 10,
            bytes_total: None,
            eta_seconds: None,
        });
        drop_prepare_sender(&mock);

        match terminal(&mut rx).await {
            LoadEvent::Failed { message, .. } => assert!(message.contains("closed")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(reg.get("base").unwrap().load_state, LoadState::Failed);
    }

    #[test]
    fn select_requires_ready() {
        let reg = registry();
        assert!(matches!(reg.select("base"), Err(AppError::ModelNotReady(_))));
        assert!(matches!(reg.select("ghost"), Err(AppError::NotFound(_))));
        assert!(matches!(reg.selected_ready(), Err(AppError::ModelNotReady(_))));
    }

    /// Helper: closes the mock's held prepare sender.
    fn drop_prepare_sender(mock: &MockEngine) {
        mock.close_prepare();
    }
}
