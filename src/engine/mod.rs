//! Inference engine abstraction.
//!
//! `Engine` is an enum over concrete backends.  Add a new variant + module
//! for each additional backend.  Enum dispatch avoids `dyn` trait objects
//! and the `async-trait` dependency.
//!
//! Both engine operations are event streams consumed over channels:
//! `prepare` yields download progress ending in exactly one terminal event,
//! and `generate` yields text deltas ending in a completion or failure.
//! The caller (registry / session orchestrator) is the sole consumer of a
//! returned receiver and processes events in arrival order.
//!
//! Engine instances are shared immutable capabilities — clone them freely.

pub mod llama_http;
pub mod mock;

use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::ModelDescriptor;

// ── Events ───────────────────────────────────────────────────────────────────

/// Event emitted while a backend fetches and loads model weights.
#[derive(Debug, Clone)]
pub enum PrepareEvent {
    Progress {
        bytes_loaded: u64,
        bytes_total: Option<u64>,
        /// Advisory; absent or non-positive means "unknown".
        eta_seconds: Option<f64>,
    },
    Ready,
    Failed { message: String },
}

/// Event emitted during a streaming generation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An incremental text fragment.
    Delta { text: String },
    Completed(Completion),
    Failed { message: String },
}

/// Terminal statistics reported by the backend for a finished generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Time spent processing the prompt, in seconds (0 if unreported).
    pub prefill_seconds: f64,
    /// Time spent emitting tokens, in seconds (0 if unreported).
    pub decode_seconds: f64,
}

// ── Request types ────────────────────────────────────────────────────────────

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { temperature: 0.7, top_p: 0.95 }
    }
}

/// One turn of the prompt as the backend sees it.  The content of the last
/// user message may differ from the conversation record when retrieval
/// augmentation is active.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    /// Wire role: `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

// ── Engine enum ──────────────────────────────────────────────────────────────

/// All available engine backends.
#[derive(Clone)]
pub enum Engine {
    /// Scripted in-process backend for tests and offline development.
    Mock(mock::MockEngine),
    /// OpenAI-compatible local HTTP server (llama.cpp and friends).
    LlamaHttp(llama_http::LlamaHttpEngine),
}

impl Engine {
    /// Fetch and load the weights for `descriptor`.
    ///
    /// The returned stream emits zero or more `Progress` events with
    /// monotonically non-decreasing `bytes_loaded`, then exactly one
    /// terminal `Ready` or `Failed`.
    pub fn prepare(&self, descriptor: &ModelDescriptor) -> mpsc::UnboundedReceiver<PrepareEvent> {
        match self {
            Engine::Mock(e) => e.prepare(descriptor),
            Engine::LlamaHttp(e) => e.prepare(descriptor),
        }
    }

    /// Start a streaming generation for `prompt`.
    ///
    /// Fails only when the backend cannot start at all; runtime failures
    /// arrive on the stream as `StreamEvent::Failed`.
    pub fn generate(
        &self,
        prompt: Vec<PromptMessage>,
        params: GenerationParams,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, AppError> {
        match self {
            Engine::Mock(e) => e.generate(prompt, params),
            Engine::LlamaHttp(e) => e.generate(prompt, params),
        }
    }

    /// Ask the backend to stop the in-flight generation, if any.
    ///
    /// Best-effort: deltas already emitted may still be in flight.  The
    /// session orchestrator's epoch check is what guarantees they are
    /// discarded.
    pub fn cancel(&self) {
        match self {
            Engine::Mock(e) => e.cancel(),
            Engine::LlamaHttp(e) => e.cancel(),
        }
    }
}
