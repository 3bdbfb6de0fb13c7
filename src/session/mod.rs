//! Session orchestrator — one cancellable streaming generation at a time.
//!
//! The orchestrator owns the conversation record and the generation state
//! machine:
//!
//! ```text
//! Idle ──accept──▶ Preparing ──engine invoked──▶ Streaming ──▶ Completed
//!                      │                            │  │
//!                      └──engine start failure──▶ Failed ◀──┘ (runtime failure)
//!                                                    │
//!                                              Interrupted (interrupt())
//! ```
//!
//! Terminal states accept the next `generate` call, which replaces the
//! session.
//!
//! Concurrency: all state lives behind one mutex; every effect (accept,
//! delta, completion, interrupt, reset) runs under that lock, which is what
//! serializes them.  A background pump task is the sole consumer of the
//! engine's event stream and applies events in arrival order.  Each
//! accepted generation advances an epoch counter captured by its pump;
//! `interrupt` advances the epoch again, so any event still in flight
//! carries a stale epoch and is dropped before it can touch the transcript.
//! A boolean "stop" flag cannot give that guarantee — a delta already past
//! the flag check would still land.

pub mod history;
pub mod perf;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, GenerationParams, PromptMessage, StreamEvent};
use crate::error::AppError;
use crate::models::{LoadEvent, ModelRegistry};
use crate::retrieval::RetrievalIndex;

pub use history::{ChatHistory, ChatTurn, Role};
pub use perf::PerformanceReport;

/// Delimiter block placed in front of retrieved context in the engine
/// prompt.  The conversation record never contains it.
const CONTEXT_PREAMBLE: &str =
    "Use the following context to answer the question:\n\n---\n\n";
const CONTEXT_POSTAMBLE: &str = "\n\n---\n\n";

// ── Session types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Streaming,
    Interrupted,
    Completed,
    Failed,
}

impl SessionState {
    /// `true` while a generation occupies the orchestrator.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Preparing | SessionState::Streaming)
    }
}

/// The current (or most recent) generation session.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub state: SessionState,
    pub accumulated_text: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationSession {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            accumulated_text: String::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// How a streamed generation ended, delivered to the completion sink.
/// Interrupted sessions do not invoke the sink — the interrupter already
/// knows.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Completed(PerformanceReport),
    Failed { message: String },
}

/// Receives each delta exactly once, in arrival order.
///
/// Sinks are invoked from the pump task right after the transcript update
/// they correspond to; they must not call back into the orchestrator.
pub type DeltaSink = Box<dyn FnMut(&str) + Send + 'static>;
pub type CompletionSink = Box<dyn FnOnce(GenerationOutcome) + Send + 'static>;

struct SessionInner {
    session: GenerationSession,
    /// Epoch of the generation whose events are currently valid.
    epoch: u64,
    history: ChatHistory,
    report: Option<PerformanceReport>,
    started_instant: Option<Instant>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// Drives generations against the engine, grounded by the retrieval index,
/// gated on the registry's selected model.  Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Mutex<SessionInner>>,
    engine: Engine,
    registry: ModelRegistry,
    index: RetrievalIndex,
    /// How many retrieved chunks to prepend when augmentation is on.
    top_k: usize,
}

impl Orchestrator {
    pub fn new(
        engine: Engine,
        registry: ModelRegistry,
        index: RetrievalIndex,
        top_k: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                session: GenerationSession::idle(),
                epoch: 0,
                history: ChatHistory::default(),
                report: None,
                started_instant: None,
            })),
            engine,
            registry,
            index,
            top_k,
        }
    }

    // ── Generation ───────────────────────────────────────────────────────────

    /// Accept a user message and start a streaming generation.
    ///
    /// Returns as soon as the stream is running; deltas and the terminal
    /// outcome arrive on the sinks.  Fails with `SessionBusy` while a
    /// session is `Preparing`/`Streaming` and with `ModelNotReady` when no
    /// `Ready` model is selected — in both cases nothing is mutated.
    ///
    /// With `use_rag`, the retrieval index is queried with the user text
    /// and any hits are prepended (behind a fixed delimiter block) to the
    /// last user message of the *engine prompt only*; the conversation
    /// record keeps the original text.
    pub fn generate(
        &self,
        text: &str,
        params: GenerationParams,
        use_rag: bool,
        on_delta: DeltaSink,
        on_complete: CompletionSink,
    ) -> Result<(), AppError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::InvalidInput("message is empty".into()));
        }
        let model = self.registry.selected_ready()?;

        // Accept: replace the previous (terminal) session.
        let (epoch, mut prompt) = {
            let mut g = self.lock();
            if g.session.state.is_active() {
                return Err(AppError::SessionBusy("a generation is already in progress".into()));
            }

            g.epoch += 1;
            g.session = GenerationSession {
                state: SessionState::Preparing,
                accumulated_text: String::new(),
                started_at: Some(Utc::now()),
                finished_at: None,
            };
            g.started_instant = Some(Instant::now());
            g.history.push(ChatTurn::user(text.clone()));

            let prompt: Vec<PromptMessage> = g
                .history
                .turns()
                .iter()
                .map(|t| PromptMessage {
                    role: t.role.as_wire().to_string(),
                    content: t.text(),
                })
                .collect();
            (g.epoch, prompt)
        };

        // Retrieval augmentation is invisible to the conversation record:
        // only the engine prompt's last user message is rewritten.
        if use_rag {
            let chunks = self.index.search(&text, self.top_k);
            if !chunks.is_empty() {
                debug!(chunks = chunks.len(), "prompt augmented with retrieved context");
                if let Some(last) = prompt.last_mut() {
                    last.content = format!(
                        "{CONTEXT_PREAMBLE}{}{CONTEXT_POSTAMBLE}{text}",
                        chunks.join("\n\n")
                    );
                }
            }
        }

        info!(model_id = %model.id, epoch, "generation started");
        let rx = match self.engine.generate(prompt, params) {
            Ok(rx) => rx,
            Err(e) => {
                let mut g = self.lock();
                if g.epoch == epoch {
                    g.session.state = SessionState::Failed;
                    g.session.finished_at = Some(Utc::now());
                }
                warn!(error = %e, "engine failed to start");
                return Err(e);
            }
        };

        {
            let mut g = self.lock();
            g.session.state = SessionState::Streaming;
            g.history.push(ChatTurn::assistant_placeholder());
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_stream_pump(epoch, rx, on_delta, on_complete).await;
        });
        Ok(())
    }

    /// Sole consumer of one generation's event stream.  Every mutation is
    /// gated on the epoch captured at accept time.
    async fn run_stream_pump(
        &self,
        epoch: u64,
        mut rx: mpsc::UnboundedReceiver<StreamEvent>,
        mut on_delta: DeltaSink,
        on_complete: CompletionSink,
    ) {
        let mut on_complete = Some(on_complete);

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Delta { text } => {
                    let deliver = {
                        let mut g = self.lock();
                        if g.epoch != epoch || g.session.state != SessionState::Streaming {
                            debug!(epoch, "stale delta dropped");
                            false
                        } else {
                            g.session.accumulated_text.push_str(&text);
                            g.history.append_delta(&text);
                            true
                        }
                    };
                    if deliver {
                        on_delta(&text);
                    }
                }

                StreamEvent::Completed(completion) => {
                    let report = {
                        let mut g = self.lock();
                        if g.epoch != epoch || g.session.state != SessionState::Streaming {
                            debug!(epoch, "stale completion dropped");
                            return;
                        }
                        let wall_clock = g
                            .started_instant
                            .map(|s| s.elapsed().as_secs_f64())
                            .unwrap_or(0.0);
                        let report = PerformanceReport::from_completion(&completion, wall_clock);
                        g.session.state = SessionState::Completed;
                        g.session.finished_at = Some(Utc::now());
                        g.report = Some(report);
                        report
                    };
                    info!(
                        total_tokens = report.total_tokens,
                        decode_tps = report.decode_tokens_per_second,
                        "generation completed"
                    );
                    if let Some(sink) = on_complete.take() {
                        sink(GenerationOutcome::Completed(report));
                    }
                    return;
                }

                StreamEvent::Failed { message } => {
                    {
                        let mut g = self.lock();
                        if g.epoch != epoch || g.session.state != SessionState::Streaming {
                            debug!(epoch, "stale failure dropped");
                            return;
                        }
                        // Partial text stays in place; only the in-flight
                        // turn is marked failed by the state transition.
                        g.session.state = SessionState::Failed;
                        g.session.finished_at = Some(Utc::now());
                    }
                    warn!(error = %message, "generation failed");
                    if let Some(sink) = on_complete.take() {
                        sink(GenerationOutcome::Failed { message });
                    }
                    return;
                }
            }
        }

        // Stream closed without a terminal event.
        let failed = {
            let mut g = self.lock();
            if g.epoch != epoch || g.session.state != SessionState::Streaming {
                false
            } else {
                g.session.state = SessionState::Failed;
                g.session.finished_at = Some(Utc::now());
                true
            }
        };
        if failed {
            warn!(epoch, "engine closed the stream without a terminal event");
            if let Some(sink) = on_complete.take() {
                sink(GenerationOutcome::Failed {
                    message: "engine closed the stream".into(),
                });
            }
        }
    }

    /// Stop the in-flight generation.  No-op unless `Streaming`.
    ///
    /// The session transitions to `Interrupted` immediately and the epoch
    /// advances, so a delta the engine already emitted can never be
    /// appended afterwards.  The accumulated text stays finalized in the
    /// assistant turn.
    pub fn interrupt(&self) {
        {
            let mut g = self.lock();
            if g.session.state != SessionState::Streaming {
                return;
            }
            g.epoch += 1;
            g.session.state = SessionState::Interrupted;
            g.session.finished_at = Some(Utc::now());
        }
        self.engine.cancel();
        info!("generation interrupted");
    }

    /// Clear the conversation and the performance report.
    /// Fails with `SessionBusy` while a generation is active.
    pub fn reset_chat(&self) -> Result<(), AppError> {
        let mut g = self.lock();
        if g.session.state.is_active() {
            return Err(AppError::SessionBusy("cannot reset during a generation".into()));
        }
        g.epoch += 1;
        g.history.clear();
        g.report = None;
        g.session = GenerationSession::idle();
        info!("chat reset");
        Ok(())
    }

    // ── Model lifecycle ──────────────────────────────────────────────────────

    /// Start loading a model, forwarding progress to `events`.
    ///
    /// On the terminal `Ready` the model becomes the selected model unless
    /// a generation is streaming at that moment — switching mid-stream is
    /// rejected, and the caller may select explicitly once the session is
    /// terminal.
    pub fn load_model(
        &self,
        id: &str,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) -> Result<(), AppError> {
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        self.registry.load_model(id, &self.engine, tap_tx)?;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = tap_rx.recv().await {
                if let LoadEvent::Ready { model_id } = &event {
                    match orchestrator.select_model(model_id) {
                        Ok(()) => {}
                        Err(AppError::SessionBusy(_)) => {
                            warn!(model_id = %model_id, "model ready but not selected: generation in progress");
                        }
                        Err(e) => warn!(model_id = %model_id, error = %e, "auto-select failed"),
                    }
                }
                // Keep draining even if the subscriber went away so the
                // terminal event still updates selection.
                let _ = events.send(event);
            }
        });
        Ok(())
    }

    /// Make `id` the active model.  Rejected with `SessionBusy` while a
    /// generation is active; the registry enforces that the model is
    /// `Ready`.
    pub fn select_model(&self, id: &str) -> Result<(), AppError> {
        {
            let g = self.lock();
            if g.session.state.is_active() {
                return Err(AppError::SessionBusy(
                    "cannot switch models while a generation is in progress".into(),
                ));
            }
        }
        self.registry.select(id)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn session(&self) -> GenerationSession {
        self.lock().session.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().session.state
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.lock().history.turns().to_vec()
    }

    /// The last completed generation's report; `None` after a reset or
    /// before the first completion.
    pub fn performance_report(&self) -> Option<PerformanceReport> {
        self.lock().report
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
