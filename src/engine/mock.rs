//! Mock engine — scripted, fully in-process backend.
//!
//! Two modes:
//! - **scripted** (default): `generate` immediately queues the configured
//!   deltas followed by a synthetic completion.  Good for end-to-end flows
//!   without a model.
//! - **manual**: `generate` hands the sender side to the test, which drives
//!   the stream one event at a time via [`MockEngine::emit`].  This is what
//!   the interruption-race tests use to deliver a delta *after* an
//!   interrupt has been acknowledged.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::ModelDescriptor;

use super::{Completion, GenerationParams, PrepareEvent, PromptMessage, StreamEvent};

/// Synthetic download size reported by `prepare`.
const MOCK_TOTAL_BYTES: u64 = 4096;
/// Synthetic timing for the completion report.
const MOCK_PREFILL_SECONDS: f64 = 0.25;
const MOCK_DECODE_SECONDS: f64 = 0.5;

#[derive(Clone)]
pub struct MockEngine {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    script: Vec<String>,
    manual: bool,
    manual_prepare: bool,
    prepare_failure: Option<String>,
    start_failure: bool,
    stream_failure: Option<String>,
    cancelled: bool,
    manual_tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    prepare_tx: Option<mpsc::UnboundedSender<PrepareEvent>>,
    last_prompt: Option<Vec<PromptMessage>>,
}

impl MockEngine {
    /// Scripted mode: each generation replays `deltas` then completes.
    pub fn scripted<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(deltas.into_iter().map(Into::into).collect(), false)
    }

    /// Manual mode: the caller drives the stream via [`MockEngine::emit`].
    pub fn manual() -> Self {
        Self::build(Vec::new(), true)
    }

    fn build(script: Vec<String>, manual: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                script,
                manual,
                manual_prepare: false,
                prepare_failure: None,
                start_failure: false,
                stream_failure: None,
                cancelled: false,
                manual_tx: None,
                prepare_tx: None,
                last_prompt: None,
            })),
        }
    }

    /// Every `prepare` call terminates in `Failed` with this message.
    pub fn with_prepare_failure(self, message: impl Into<String>) -> Self {
        self.lock().prepare_failure = Some(message.into());
        self
    }

    /// `generate` refuses to start (returns an error instead of a stream).
    pub fn with_start_failure(self) -> Self {
        self.lock().start_failure = true;
        self
    }

    /// `prepare` streams stay open until driven via
    /// [`MockEngine::emit_prepare`] — lets tests hold a load in flight.
    pub fn with_manual_prepare(self) -> Self {
        self.lock().manual_prepare = true;
        self
    }

    /// Scripted generations emit their deltas, then fail instead of
    /// completing.
    pub fn with_stream_failure(self, message: impl Into<String>) -> Self {
        self.lock().stream_failure = Some(message.into());
        self
    }

    pub fn prepare(&self, _descriptor: &ModelDescriptor) -> mpsc::UnboundedReceiver<PrepareEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if inner.manual_prepare {
            inner.prepare_tx = Some(tx);
            return rx;
        }

        if let Some(message) = &inner.prepare_failure {
            let _ = tx.send(PrepareEvent::Failed { message: message.clone() });
            return rx;
        }

        let step = MOCK_TOTAL_BYTES / 4;
        for n in 1..=4u64 {
            let loaded = n * step;
            let _ = tx.send(PrepareEvent::Progress {
                bytes_loaded: loaded,
                bytes_total: Some(MOCK_TOTAL_BYTES),
                eta_seconds: Some((MOCK_TOTAL_BYTES - loaded) as f64 / step as f64),
            });
        }
        let _ = tx.send(PrepareEvent::Ready);
        rx
    }

    pub fn generate(
        &self,
        prompt: Vec<PromptMessage>,
        _params: GenerationParams,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, AppError> {
        let mut inner = self.lock();

        if inner.start_failure {
            return Err(AppError::EngineFailure("mock engine refused to start".into()));
        }

        let prompt_tokens: u64 = prompt
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        inner.last_prompt = Some(prompt);
        inner.cancelled = false;

        let (tx, rx) = mpsc::unbounded_channel();

        if inner.manual {
            inner.manual_tx = Some(tx);
            return Ok(rx);
        }

        for delta in &inner.script {
            let _ = tx.send(StreamEvent::Delta { text: delta.clone() });
        }
        match &inner.stream_failure {
            Some(message) => {
                let _ = tx.send(StreamEvent::Failed { message: message.clone() });
            }
            None => {
                let _ = tx.send(StreamEvent::Completed(Completion {
                    prompt_tokens,
                    completion_tokens: inner.script.len() as u64,
                    prefill_seconds: MOCK_PREFILL_SECONDS,
                    decode_seconds: MOCK_DECODE_SECONDS,
                }));
            }
        }
        Ok(rx)
    }

    pub fn cancel(&self) {
        self.lock().cancelled = true;
    }

    // ── Test handles ─────────────────────────────────────────────────────────

    /// Manual mode only: push an event into the open stream.  Returns
    /// `false` when no stream is open or the consumer is gone.
    pub fn emit(&self, event: StreamEvent) -> bool {
        let inner = self.lock();
        match &inner.manual_tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Manual-prepare mode only: push an event into the open prepare
    /// stream.
    pub fn emit_prepare(&self, event: PrepareEvent) -> bool {
        let inner = self.lock();
        match &inner.prepare_tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Manual-prepare mode only: drop the held prepare sender, closing the
    /// stream without a terminal event.
    pub fn close_prepare(&self) {
        self.lock().prepare_tx = None;
    }

    /// Whether `cancel` has been called since the last `generate`.
    pub fn was_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// The prompt the engine received on the most recent `generate` call.
    pub fn last_prompt(&self) -> Option<Vec<PromptMessage>> {
        self.lock().last_prompt.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::built_in("m1", "https://example.test/m1.gguf", "llama-cpp/v0")
    }

    #[tokio::test]
    async fn scripted_generation_streams_then_completes() {
        let engine = MockEngine::scripted(["He", "llo"]);
        let mut rx = engine
            .generate(vec![PromptMessage::user("hi there")], GenerationParams::default())
            .unwrap();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Delta { text }) if text == "He"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Delta { text }) if text == "llo"));
        match rx.recv().await {
            Some(StreamEvent::Completed(c)) => {
                assert_eq!(c.prompt_tokens, 2);
                assert_eq!(c.completion_tokens, 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_failure_replaces_completion() {
        let engine = MockEngine::scripted(["x"]).with_stream_failure("gpu fell over");
        let mut rx = engine
            .generate(vec![PromptMessage::user("hi")], GenerationParams::default())
            .unwrap();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Delta { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Failed { message }) if message.contains("gpu")));
    }

    #[tokio::test]
    async fn start_failure_returns_error() {
        let engine = MockEngine::scripted(["x"]).with_start_failure();
        assert!(engine
            .generate(vec![PromptMessage::user("hi")], GenerationParams::default())
            .is_err());
    }

    #[tokio::test]
    async fn manual_mode_delivers_emitted_events() {
        let engine = MockEngine::manual();
        let mut rx = engine
            .generate(vec![PromptMessage::user("hi")], GenerationParams::default())
            .unwrap();

        assert!(engine.emit(StreamEvent::Delta { text: "a".into() }));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Delta { text }) if text == "a"));
    }

    #[tokio::test]
    async fn prepare_progress_is_monotonic_with_one_terminal() {
        let engine = MockEngine::scripted(Vec::<String>::new());
        let mut rx = engine.prepare(&descriptor());

        let mut last = 0;
        let mut terminals = 0;
        while let Some(ev) = rx.recv().await {
            match ev {
                PrepareEvent::Progress { bytes_loaded, .. } => {
                    assert!(bytes_loaded >= last);
                    last = bytes_loaded;
                }
                PrepareEvent::Ready | PrepareEvent::Failed { .. } => terminals += 1,
            }
        }
        assert_eq!(terminals, 1);
        assert_eq!(last, MOCK_TOTAL_BYTES);
    }

    #[tokio::test]
    async fn prepare_failure_is_terminal() {
        let engine = MockEngine::scripted(Vec::<String>::new()).with_prepare_failure("404");
        let mut rx = engine.prepare(&descriptor());
        assert!(matches!(rx.recv().await, Some(PrepareEvent::Failed { message }) if message == "404"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_is_recorded() {
        let engine = MockEngine::manual();
        let _rx = engine
            .generate(vec![PromptMessage::user("hi")], GenerationParams::default())
            .unwrap();
        assert!(!engine.was_cancelled());
        engine.cancel();
        assert!(engine.was_cancelled());
    }
}
