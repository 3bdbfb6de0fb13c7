//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `HEARTH_WORK_DIR` and `HEARTH_LOG_LEVEL` env overrides.
//! Every section except `[app]` is optional and falls back to built-in
//! defaults.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;

/// Settings store: default model ids and the auto-load switch.
///
/// Read once at startup to decide whether to auto-trigger a model load.
#[derive(Debug, Clone)]
pub struct ModelsConfig {
    /// Model id to select/load by default.
    pub default_model: String,
    /// Embedding model id reserved for collaborators; unused by this core.
    pub default_embedding_model: String,
    /// Auto-trigger `load_model(default_model)` at startup.
    pub auto_load: bool,
}

/// Inference engine backend configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which backend is active (`"mock"` or `"llama-http"`).
    pub backend: String,
    /// Chat completions endpoint for the `llama-http` backend.
    pub api_base_url: String,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
}

/// Retrieval index parameters.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Window size in characters for the chunker.
    pub chunk_size: usize,
    /// Overlap in characters between consecutive windows.
    pub chunk_overlap: usize,
    /// How many chunks a search returns at most.
    pub top_k: usize,
    /// Seed one starter document when the index starts empty.
    pub seed_default_doc: bool,
}

/// Default sampling parameters for generation.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
}

/// Fully-resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub models: ModelsConfig,
    pub engine: EngineConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
}

impl Config {
    /// Path of the document-set snapshot file under `work_dir`.
    pub fn documents_path(&self) -> PathBuf {
        self.work_dir.join("documents.json")
    }

    /// Directory where downloaded model weights are stored.
    pub fn models_dir(&self) -> PathBuf {
        self.work_dir.join("models")
    }
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    app: RawApp,
    #[serde(default)]
    models: RawModels,
    #[serde(default)]
    engine: RawEngine,
    #[serde(default)]
    retrieval: RawRetrieval,
    #[serde(default)]
    generation: RawGeneration,
}

#[derive(Deserialize)]
struct RawApp {
    name: String,
    work_dir: String,
    log_level: String,
}

#[derive(Deserialize)]
struct RawModels {
    #[serde(default = "default_model_id")]
    default_model: String,
    #[serde(default = "default_embedding_model_id")]
    default_embedding_model: String,
    /// Defaults to `true`: the configured model loads on startup unless
    /// explicitly disabled.
    #[serde(default = "default_true")]
    auto_load: bool,
}

impl Default for RawModels {
    fn default() -> Self {
        Self {
            default_model: default_model_id(),
            default_embedding_model: default_embedding_model_id(),
            auto_load: true,
        }
    }
}

#[derive(Deserialize)]
struct RawEngine {
    #[serde(default = "default_engine_backend")]
    backend: String,
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_engine_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawEngine {
    fn default() -> Self {
        Self {
            backend: default_engine_backend(),
            api_base_url: default_api_base_url(),
            timeout_seconds: default_engine_timeout_seconds(),
        }
    }
}

#[derive(Deserialize)]
struct RawRetrieval {
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_true")]
    seed_default_doc: bool,
}

impl Default for RawRetrieval {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            seed_default_doc: true,
        }
    }
}

#[derive(Deserialize)]
struct RawGeneration {
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_top_p")]
    top_p: f32,
}

impl Default for RawGeneration {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

fn default_model_id() -> String { "qwen2.5-1.5b-instruct-q4".to_string() }
fn default_embedding_model_id() -> String { "all-minilm-l6-v2".to_string() }
fn default_engine_backend() -> String { "mock".to_string() }
fn default_api_base_url() -> String { "http://127.0.0.1:8080/v1/chat/completions".to_string() }
fn default_engine_timeout_seconds() -> u64 { 120 }
fn default_chunk_size() -> usize { 200 }
fn default_chunk_overlap() -> usize { 50 }
fn default_top_k() -> usize { 3 }
fn default_temperature() -> f32 { 0.7 }
fn default_top_p() -> f32 { 0.95 }

fn default_true() -> bool {
    true
}

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    let work_dir_override = env::var("HEARTH_WORK_DIR").ok();
    let log_level_override = env::var("HEARTH_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let a = parsed.app;

    let work_dir_str = work_dir_override.unwrap_or(&a.work_dir).to_string();
    let work_dir = expand_home(&work_dir_str);
    let log_level = log_level_override.unwrap_or(&a.log_level).to_string();

    if parsed.retrieval.chunk_size == 0 {
        return Err(AppError::Config("retrieval.chunk_size must be > 0".into()));
    }
    if parsed.retrieval.chunk_overlap >= parsed.retrieval.chunk_size {
        return Err(AppError::Config(
            "retrieval.chunk_overlap must be smaller than retrieval.chunk_size".into(),
        ));
    }

    Ok(Config {
        app_name: a.name,
        work_dir,
        log_level,
        models: ModelsConfig {
            default_model: parsed.models.default_model,
            default_embedding_model: parsed.models.default_embedding_model,
            auto_load: parsed.models.auto_load,
        },
        engine: EngineConfig {
            backend: parsed.engine.backend,
            api_base_url: parsed.engine.api_base_url,
            timeout_seconds: parsed.engine.timeout_seconds,
        },
        retrieval: RetrievalConfig {
            chunk_size: parsed.retrieval.chunk_size,
            chunk_overlap: parsed.retrieval.chunk_overlap,
            top_k: parsed.retrieval.top_k,
            seed_default_doc: parsed.retrieval.seed_default_doc,
        },
        generation: GenerationConfig {
            temperature: parsed.generation.temperature,
            top_p: parsed.generation.top_p,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for unit tests — mock engine, no network, no home-dir deps.
#[cfg(test)]
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            app_name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            models: ModelsConfig {
                default_model: "test-model".into(),
                default_embedding_model: "test-embed".into(),
                auto_load: false,
            },
            engine: EngineConfig {
                backend: "mock".into(),
                api_base_url: "http://localhost:0/v1/chat/completions".into(),
                timeout_seconds: 1,
            },
            retrieval: RetrievalConfig {
                chunk_size: 200,
                chunk_overlap: 50,
                top_k: 3,
                seed_default_doc: false,
            },
            generation: GenerationConfig {
                temperature: 0.0,
                top_p: 1.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[app]
name = "test-hearth"
work_dir = "~/.hearth"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_basic_config() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.app_name, "test-hearth");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn missing_sections_take_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.retrieval.chunk_size, 200);
        assert_eq!(cfg.retrieval.chunk_overlap, 50);
        assert_eq!(cfg.retrieval.top_k, 3);
        assert_eq!(cfg.engine.backend, "mock");
        assert!(cfg.models.auto_load);
        assert!((cfg.generation.temperature - 0.7).abs() < f32::EPSILON);
        assert!((cfg.generation.top_p - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let f = write_toml(
            r#"
[app]
name = "x"
work_dir = "/tmp/x"
log_level = "info"

[retrieval]
chunk_size = 10
chunk_overlap = 10
"#,
        );
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.hearth");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".hearth"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("config error"));
    }

    #[test]
    fn env_style_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/test-override"), Some("debug")).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/test-override"));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_default_is_mock_backed_and_offline() {
        let cfg = Config::test_default(Path::new("/tmp/hearth-test"));
        assert_eq!(cfg.engine.backend, "mock");
        assert!(!cfg.models.auto_load);
        assert!(!cfg.retrieval.seed_default_doc);
    }

    #[test]
    fn derived_paths_live_under_work_dir() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/hearth-test"), None).unwrap();
        assert_eq!(cfg.documents_path(), PathBuf::from("/tmp/hearth-test/documents.json"));
        assert_eq!(cfg.models_dir(), PathBuf::from("/tmp/hearth-test/models"));
    }
}
