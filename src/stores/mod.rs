//! Storage backends for chunk documents, embeddings, slide links, and the
//! image pool.
//!
//! [`VectorBackend`] abstracts vector storage so retrieval code is not tied
//! to one database. The shipped implementation is
//! [`sqlite::SqliteKbStore`], backed by `sqlite-vec` for cosine similarity.
//! The pool and staleness traits live next to their domain types
//! ([`crate::pool::PoolBackend`], [`crate::staleness::SlideLinkSource`]);
//! `SqliteKbStore` implements all three against one connection.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::KbError;

pub use sqlite::SqliteKbStore;

/// A chunk with its embedding, ready for storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub document_title: String,
    pub heading: Option<String>,
    /// Zero-based position of this chunk within its document.
    pub chunk_index: usize,
    pub content: String,
    /// Additional metadata as JSON (section path, heading level).
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        chunk_index: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            document_title: String::new(),
            heading: None,
            chunk_index,
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
            embedding: None,
        }
    }

    #[must_use]
    pub fn with_document_title(mut self, title: impl Into<String>) -> Self {
        self.document_title = title.into();
        self
    }

    #[must_use]
    pub fn with_heading(mut self, heading: Option<String>) -> Self {
        self.heading = heading;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Unified interface for chunk/vector storage backends.
///
/// One similarity metric per store instance; the embedding dimension is
/// fixed by the first inserted vector and mixing dimensions is an error.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Insert chunk records. Records carrying embeddings become searchable.
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), KbError>;

    /// All chunks of a document, ordered by `chunk_index`.
    async fn get_chunks_by_document(&self, document_id: &str)
        -> Result<Vec<ChunkRecord>, KbError>;

    /// Delete a document's full chunk set (embeddings included). Returns
    /// the number of chunks removed.
    async fn delete_chunks_by_document(&self, document_id: &str) -> Result<usize, KbError>;

    /// Replace a document's full chunk set in one atomic step: the delete
    /// and the insert commit together, so any failure leaves the previous
    /// chunk set intact.
    async fn replace_document_chunks(
        &self,
        document_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), KbError>;

    /// Similarity search: best matches first, at most `top_k`, ties broken
    /// by chunk insertion order. An empty index returns an empty vector.
    async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>, KbError>;

    /// Total number of stored chunks.
    async fn count(&self) -> Result<usize, KbError>;
}
