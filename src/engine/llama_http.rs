//! OpenAI-compatible HTTP backend (`/v1/chat/completions`, streaming).
//!
//! Covers llama.cpp's `llama-server` and other local servers speaking the
//! same wire protocol.  `prepare` fetches model weights over HTTP into the
//! models directory, reporting byte progress; `generate` opens a streaming
//! chat completion and forwards SSE deltas.  All wire types are private to
//! this module — callers never see them.
//!
//! Constructed once at startup, then cheaply cloned because
//! `reqwest::Client` is an `Arc` internally.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::models::ModelDescriptor;

use super::{Completion, GenerationParams, PrepareEvent, PromptMessage, StreamEvent};

#[derive(Clone)]
pub struct LlamaHttpEngine {
    client: Client,
    api_base_url: String,
    models_dir: PathBuf,
    /// Cancellation handle for the in-flight generation, if any.
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl LlamaHttpEngine {
    /// Build the backend from config values.
    ///
    /// Only the connect phase is bounded by `timeout_seconds`; a
    /// total-request timeout would cut off long downloads and generations.
    pub fn new(
        api_base_url: impl Into<String>,
        timeout_seconds: u64,
        models_dir: impl Into<PathBuf>,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| AppError::EngineFailure(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base_url: api_base_url.into(),
            models_dir: models_dir.into(),
            cancel: Arc::new(Mutex::new(None)),
        })
    }

    pub fn prepare(&self, descriptor: &ModelDescriptor) -> mpsc::UnboundedReceiver<PrepareEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = descriptor.source_locator.clone();
        let dest = self.models_dir.join(format!("{}.gguf", descriptor.id));
        let model_id = descriptor.id.clone();

        tokio::spawn(async move {
            if dest.exists() {
                info!(model_id = %model_id, path = %dest.display(), "weights already cached");
                let _ = tx.send(PrepareEvent::Ready);
                return;
            }

            match download(&client, &url, &dest, &tx).await {
                Ok(digest) => {
                    debug!(model_id = %model_id, sha256 = %digest, "weights downloaded");
                    let _ = tx.send(PrepareEvent::Ready);
                }
                Err(message) => {
                    // Never leave a truncated weights file behind.
                    let _ = tokio::fs::remove_file(&dest).await;
                    warn!(model_id = %model_id, error = %message, "weight download failed");
                    let _ = tx.send(PrepareEvent::Failed { message });
                }
            }
        });

        rx
    }

    pub fn generate(
        &self,
        prompt: Vec<PromptMessage>,
        params: GenerationParams,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, AppError> {
        let payload = ChatCompletionRequest {
            messages: prompt
                .into_iter()
                .map(|m| WireMessage { role: m.role, content: m.content })
                .collect(),
            temperature: params.temperature,
            top_p: params.top_p,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        };

        let token = CancellationToken::new();
        *lock_cancel(&self.cancel) = Some(token.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.api_base_url.clone();
        tokio::spawn(run_stream(client, url, payload, token, tx));
        Ok(rx)
    }

    pub fn cancel(&self) {
        if let Some(token) = lock_cancel(&self.cancel).take() {
            debug!("cancelling in-flight generation");
            token.cancel();
        }
    }
}

fn lock_cancel(
    cancel: &Arc<Mutex<Option<CancellationToken>>>,
) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
    cancel.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Weight download ──────────────────────────────────────────────────────────

/// Stream `url` into `dest`, emitting byte progress.  Returns the SHA-256
/// hex digest of the downloaded bytes.
async fn download(
    client: &Client,
    url: &str,
    dest: &Path,
    tx: &mpsc::UnboundedSender<PrepareEvent>,
) -> Result<String, String> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request {url}: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}: {url}", response.status()));
    }

    let total = response.content_length();
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| format!("create {}: {e}", dest.display()))?;

    let started = Instant::now();
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("read body: {e}"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write {}: {e}", dest.display()))?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;

        let _ = tx.send(PrepareEvent::Progress {
            bytes_loaded: downloaded,
            bytes_total: total,
            eta_seconds: estimate_remaining(downloaded, total, started.elapsed().as_secs_f64()),
        });
    }

    file.flush().await.map_err(|e| format!("flush {}: {e}", dest.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Advisory seconds-remaining estimate from the average rate so far.
/// `None` when the total size or the rate is unknown.
fn estimate_remaining(downloaded: u64, total: Option<u64>, elapsed: f64) -> Option<f64> {
    let total = total?;
    if downloaded == 0 || elapsed <= 0.0 {
        return None;
    }
    let rate = downloaded as f64 / elapsed;
    Some(total.saturating_sub(downloaded) as f64 / rate)
}

// ── Streaming generation ─────────────────────────────────────────────────────

async fn run_stream(
    client: Client,
    url: String,
    payload: ChatCompletionRequest,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let response = match client.post(&url).json(&payload).send().await {
        Ok(r) => r,
        Err(e) => {
            error!(url = %url, error = %e, "chat completion request failed");
            let _ = tx.send(StreamEvent::Failed { message: e.to_string() });
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(%status, "chat completion returned HTTP error");
        let _ = tx.send(StreamEvent::Failed { message: format!("HTTP {status}: {body}") });
        return;
    }

    let started = Instant::now();
    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    let mut completion = Completion::default();

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                // The consumer has moved on; just close the connection.
                debug!("generation cancelled — dropping response stream");
                return;
            }

            chunk = stream.next() => match chunk {
                None => break,
                Some(Err(e)) => {
                    let _ = tx.send(StreamEvent::Failed { message: format!("read stream: {e}") });
                    return;
                }
                Some(Ok(bytes)) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        match parse_data_line(line.trim()) {
                            Some(SsePayload::Done) => {
                                finish(&tx, &mut completion, started);
                                return;
                            }
                            Some(SsePayload::Chunk(chunk)) => {
                                apply_chunk(chunk, &tx, &mut completion);
                            }
                            None => {}
                        }
                    }
                }
            }
        }
    }

    // Stream closed without an explicit [DONE]; still a completion.
    finish(&tx, &mut completion, started);
}

fn finish(tx: &mpsc::UnboundedSender<StreamEvent>, completion: &mut Completion, started: Instant) {
    if completion.decode_seconds == 0.0 {
        completion.decode_seconds = started.elapsed().as_secs_f64();
    }
    let _ = tx.send(StreamEvent::Completed(*completion));
}

fn apply_chunk(
    chunk: StreamChunk,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    completion: &mut Completion,
) {
    if let Some(text) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        if !text.is_empty() {
            let _ = tx.send(StreamEvent::Delta { text });
        }
    }
    if let Some(usage) = chunk.usage {
        completion.prompt_tokens = usage.prompt_tokens;
        completion.completion_tokens = usage.completion_tokens;
    }
    if let Some(timings) = chunk.timings {
        completion.prefill_seconds = timings.prompt_ms / 1000.0;
        completion.decode_seconds = timings.predicted_ms / 1000.0;
    }
}

enum SsePayload {
    Chunk(StreamChunk),
    Done,
}

/// Parse one SSE line.  Non-`data:` lines and unparseable payloads are
/// ignored (the protocol allows comments and keep-alives).
fn parse_data_line(line: &str) -> Option<SsePayload> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(SsePayload::Done);
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => Some(SsePayload::Chunk(chunk)),
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream line");
            None
        }
    }
}

// ── Private wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<WireMessage>,
    temperature: f32,
    top_p: f32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    /// llama.cpp extension with server-side timing.
    #[serde(default)]
    timings: Option<WireTimings>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Debug, Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireTimings {
    #[serde(default)]
    prompt_ms: f64,
    #[serde(default)]
    predicted_ms: f64,
}
