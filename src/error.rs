//! Application-wide error types.
//!
//! One taxonomy for the whole crate.  The first group is caller errors and
//! registry invariant violations, surfaced as-is and never retried
//! internally.  The second group is transient state conflicts: the caller
//! may retry once the conflicting operation reaches a terminal state.
//! `EngineFailure` wraps anything that went wrong inside the inference
//! engine (download or generation); the owning session transitions to
//! `Failed` and partial output is preserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("in use: {0}")]
    InUse(String),

    /// A model load is already in progress for a different model.
    #[error("busy: {0}")]
    Busy(String),

    /// A generation session is already preparing or streaming.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// The selected model is missing or not in the `Ready` state.
    #[error("model not ready: {0}")]
    ModelNotReady(String),

    /// The inference engine failed during download or generation.
    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
