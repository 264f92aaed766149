//! Shared error type for the knowledge-base pipeline.

use thiserror::Error;

/// Errors produced by the ingestion and retrieval pipeline.
///
/// Remote-call failures (embedding, rerank) carry enough context for the
/// caller to decide on retries; storage errors wrap the backend's message.
/// Reranking failures are normally swallowed inside the reranker itself
/// (see [`crate::rerank`]) and only surface here from configuration issues.
#[derive(Debug, Error)]
pub enum KbError {
    /// Malformed caller input: bad chunk options, empty document text,
    /// empty category, and similar. Rejected before any work happens.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The chunker could not produce a valid chunk sequence.
    #[error("chunking failed: {0}")]
    Chunking(String),

    /// The embedding provider returned an unusable response.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Reranker configuration problem (not a remote failure; those degrade
    /// to identity behavior instead of erroring).
    #[error("rerank failed: {0}")]
    Rerank(String),

    /// Storage backend failure, including partial-transaction rejections.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
