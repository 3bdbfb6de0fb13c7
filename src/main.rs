//! Hearth — process entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger at the configured level
//!   4. Construct registry, retrieval index, engine, orchestrator
//!   5. Restore the persisted document set (and seed it if empty)
//!   6. Auto-load the default model when configured
//!   7. Run the console until shutdown, then persist documents

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth::config;
use hearth::console::Console;
use hearth::engine::{Engine, GenerationParams, llama_http::LlamaHttpEngine, mock::MockEngine};
use hearth::error::AppError;
use hearth::logger;
use hearth::models::{LoadEvent, ModelRegistry};
use hearth::retrieval::RetrievalIndex;
use hearth::session::Orchestrator;

/// Canned reply used by the mock backend so the chat loop works offline.
const MOCK_REPLY: &[&str] = &[
    "This is the scripted ",
    "offline backend. ",
    "Switch `engine.backend` to ",
    "\"llama-http\" in the config ",
    "to talk to a local model server.",
];

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::init(&config.log_level)?;

    info!(
        app = %config.app_name,
        work_dir = %config.work_dir.display(),
        log_level = %config.log_level,
        "config loaded"
    );
    std::fs::create_dir_all(&config.work_dir)?;

    // Process-wide services, lifecycle owned here rather than by any UI.
    let registry = ModelRegistry::with_builtin_catalog();
    let index = RetrievalIndex::new(config.retrieval.chunk_size, config.retrieval.chunk_overlap)?;
    index.load_all(&config.documents_path())?;
    if config.retrieval.seed_default_doc {
        index.seed_default()?;
    }

    let engine = match config.engine.backend.as_str() {
        "mock" => Engine::Mock(MockEngine::scripted(MOCK_REPLY.iter().copied())),
        "llama-http" => Engine::LlamaHttp(LlamaHttpEngine::new(
            config.engine.api_base_url.clone(),
            config.engine.timeout_seconds,
            config.models_dir(),
        )?),
        other => {
            return Err(AppError::Config(format!("unknown engine backend: {other}")));
        }
    };

    let orchestrator = Orchestrator::new(
        engine,
        registry.clone(),
        index.clone(),
        config.retrieval.top_k,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received — shutting down");
                shutdown.cancel();
            }
        });
    }

    if config.models.auto_load {
        auto_load_default(&orchestrator, &config.models.default_model);
    }

    let params = GenerationParams {
        temperature: config.generation.temperature,
        top_p: config.generation.top_p,
    };
    let console = Console::new(orchestrator, registry, index.clone(), params);
    console.run(shutdown).await?;

    index.save_all(&config.documents_path())?;
    info!("document set persisted — goodbye");
    Ok(())
}

/// Kick off the configured default model load; progress goes to the log
/// rather than the console prompt.
fn auto_load_default(orchestrator: &Orchestrator, model_id: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    match orchestrator.load_model(model_id, tx) {
        Err(e) => warn!(model_id = %model_id, error = %e, "auto-load failed to start"),
        Ok(()) => {
            info!(model_id = %model_id, "auto-loading default model");
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        LoadEvent::Progress(p) => {
                            debug!(
                                model_id = %p.model_id,
                                bytes_loaded = p.bytes_loaded,
                                bytes_total = ?p.bytes_total,
                                "download progress"
                            );
                        }
                        LoadEvent::Ready { model_id } => {
                            info!(model_id = %model_id, "default model ready");
                        }
                        LoadEvent::Failed { model_id, message } => {
                            warn!(model_id = %model_id, error = %message, "default model load failed");
                        }
                    }
                }
            });
        }
    }
}
