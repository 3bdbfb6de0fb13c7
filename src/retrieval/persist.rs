//! Document-set persistence — whole-index JSON snapshots.
//!
//! Granularity is deliberately the entire document set: `save` serialises
//! everything and replaces the snapshot file atomically (temp file + rename
//! on the same filesystem), so a crash mid-write leaves the previous
//! snapshot intact.  There is no partial-write mode.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::AppError;

use super::Document;

/// Write the full document set to `path`, replacing any previous snapshot.
pub(crate) fn save(path: &Path, docs: &[Document]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(docs)
        .map_err(|e| AppError::Storage(format!("serialize document set: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)?;
    fs::rename(&tmp, path)?;

    debug!(count = docs.len(), path = %path.display(), "document set saved");
    Ok(())
}

/// Load the full document set from `path`.  A missing file is an empty set.
pub(crate) fn load(path: &Path) -> Result<Vec<Document>, AppError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let docs: Vec<Document> = serde_json::from_str(&raw)
        .map_err(|e| AppError::Storage(format!("parse {}: {e}", path.display())))?;

    debug!(count = docs.len(), path = %path.display(), "document set loaded");
    Ok(docs)
}
