//! Retrieval index — documents, eager chunking, and the lexical scorer.
//!
//! This is deliberately *not* a vector index: scoring is a deterministic
//! keyword match so identical inputs always produce identical rankings.
//! Documents are chunked eagerly on ingestion; `chunks` is a pure function
//! of the content and the chunking parameters.
//!
//! Concurrency: the document set lives behind a `RwLock`.  A search takes
//! the read lock for its whole pass, so it observes either the pre- or
//! post-ingestion snapshot of a concurrent `add_document`, never a partial
//! document.

pub mod chunker;
mod persist;

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;

/// Query tokens no longer than this many characters are discarded.
const MIN_TOKEN_LEN: usize = 3;

/// Starter document seeded into an empty index so retrieval grounding can be
/// demonstrated before the user imports anything.
const STARTER_DOC: &str = "Hearth is a private chat assistant that runs language models entirely on \
the local machine. Model weights are downloaded on demand and swapped without restarting. \
Answers can be grounded in a personal document set: imported text is split into overlapping \
chunks, and the chunks most relevant to a question are placed in front of the prompt. \
Nothing ever leaves the device, which makes the assistant usable offline and keeps the \
document set fully private.";

// ── Document ─────────────────────────────────────────────────────────────────

/// A document as stored by the retrieval index.
///
/// `chunks` is derived from `content` at ingestion time and persisted with
/// it; re-chunking the same content with the same parameters reproduces the
/// same sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique document identifier (UUID v7).
    pub id: String,
    /// Full raw text of the document.
    pub content: String,
    /// Overlapping windows over `content`, in order.
    pub chunks: Vec<String>,
}

// ── RetrievalIndex ───────────────────────────────────────────────────────────

/// Document set plus the keyword scorer.  Cheap to clone; all clones share
/// the same underlying set.
#[derive(Clone)]
pub struct RetrievalIndex {
    docs: Arc<RwLock<Vec<Document>>>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RetrievalIndex {
    /// Create an empty index.  Fails with `InvalidInput` unless
    /// `chunk_size > chunk_overlap`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, AppError> {
        // Validate once here so ingestion can't fail on parameters later.
        chunker::chunk("x", chunk_size, chunk_overlap)?;
        Ok(Self {
            docs: Arc::new(RwLock::new(Vec::new())),
            chunk_size,
            chunk_overlap,
        })
    }

    /// Ingest `content`: chunk eagerly and append to the document set.
    ///
    /// Fails with `InvalidInput` if `content` is empty after trimming.
    pub fn add_document(&self, content: &str) -> Result<Document, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::InvalidInput("document content is empty".into()));
        }

        let doc = Document {
            id: Uuid::now_v7().to_string(),
            content: content.to_string(),
            chunks: chunker::chunk(content, self.chunk_size, self.chunk_overlap)?,
        };

        let mut docs = self.write();
        docs.push(doc.clone());
        debug!(doc_id = %doc.id, chunks = doc.chunks.len(), "document ingested");
        Ok(doc)
    }

    /// Remove a document by id.  Unknown ids are a no-op, not an error.
    pub fn remove_document(&self, id: &str) {
        let mut docs = self.write();
        let before = docs.len();
        docs.retain(|d| d.id != id);
        if docs.len() < before {
            debug!(doc_id = %id, "document removed");
        }
    }

    /// All documents in insertion order.
    pub fn list_documents(&self) -> Vec<Document> {
        self.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Score every chunk against `query` and return the `top_k` best texts.
    ///
    /// A chunk's score is the number of *distinct* query tokens that occur
    /// as a case-insensitive substring of it; repeated occurrences of the
    /// same token count once.  Tokens of length ≤ 2 are discarded, and a
    /// query with no surviving tokens returns an empty result.  Ranking is
    /// by descending score with ties broken by ingestion order (document
    /// order, then chunk order), so identical inputs always rank
    /// identically.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<String> {
        let mut tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.chars().count() >= MIN_TOKEN_LEN)
            .map(str::to_string)
            .collect();
        tokens.sort();
        tokens.dedup();

        if tokens.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let docs = self.read();
        let mut scored: Vec<(usize, &String)> = Vec::new();
        for doc in docs.iter() {
            for chunk in &doc.chunks {
                let haystack = chunk.to_lowercase();
                let score = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                if score > 0 {
                    scored.push((score, chunk));
                }
            }
        }

        // Stable sort: equal scores keep their ingestion order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(top_k).map(|(_, c)| c.clone()).collect()
    }

    /// Seed the starter document when the index is empty.
    pub fn seed_default(&self) -> Result<(), AppError> {
        if !self.is_empty() {
            return Ok(());
        }
        self.add_document(STARTER_DOC)?;
        info!("seeded starter document");
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Replace the in-memory set with the snapshot at `path` (empty if the
    /// file does not exist).
    pub fn load_all(&self, path: &Path) -> Result<(), AppError> {
        let loaded = persist::load(path)?;
        *self.write() = loaded;
        Ok(())
    }

    /// Write the whole set to `path`, atomically replacing any previous
    /// snapshot.
    pub fn save_all(&self, path: &Path) -> Result<(), AppError> {
        let docs = self.read();
        persist::save(path, &docs)
    }

    // A poisoned lock only means another thread panicked while holding it;
    // documents are pushed fully-built in a single call, so the set itself
    // is never left half-written and recovery is sound.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Document>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Document>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }
}
