//! Hearth — private local-model chat.
//!
//! Library surface for the binary and for integration tests:
//! - [`models`] — model registry, load states, download progress
//! - [`retrieval`] — document set, chunker, lexical search
//! - [`engine`] — inference backends (mock, llama-http)
//! - [`session`] — the generation session orchestrator
//! - [`config`] / [`logger`] / [`error`] — process plumbing
//!
//! The binary entry point is `src/main.rs`.

pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod logger;
pub mod models;
pub mod retrieval;
pub mod session;

pub use error::AppError;
