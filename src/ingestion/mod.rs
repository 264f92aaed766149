//! Document ingestion: chunk, embed, and persist as one unit.
//!
//! Ingestion either fully indexes a document or leaves the store untouched.
//! Embeddings are computed before anything is written, so an embedding
//! failure aborts with the previous chunk set still intact; the caller
//! reports the document as failed and may retry. Re-ingestion replaces the
//! document's full chunk set in one backend transaction, never a diff, so
//! a storage failure mid-replace also keeps the previous set.

use serde_json::json;
use uuid::Uuid;

use crate::chunker::{chunk, ChunkOptions};
use crate::embeddings::EmbeddingProvider;
use crate::stores::{ChunkRecord, VectorBackend};
use crate::types::KbError;

/// Raw extracted text handed over by the external parsing pipeline.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub id: String,
    pub title: String,
    pub text: String,
}

impl DocumentInput {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            text: text.into(),
        }
    }
}

/// Counters describing a completed ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionSummary {
    pub document_id: String,
    pub chunk_count: usize,
    /// Chunks whose content exceeded `max_chunk_size` (unsplittable
    /// paragraphs; allowed but worth surfacing).
    pub oversized_chunks: usize,
}

/// Chunks `document.text`, embeds every chunk, and replaces the document's
/// chunk set in the backend.
pub async fn ingest_document<B: VectorBackend>(
    backend: &B,
    provider: &dyn EmbeddingProvider,
    document: &DocumentInput,
    options: &ChunkOptions,
) -> Result<IngestionSummary, KbError> {
    if document.id.trim().is_empty() {
        return Err(KbError::InvalidInput("document id is empty".into()));
    }

    let chunks = chunk(&document.text, options)?;
    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

    // Any batch failure fails the whole document before the store changes.
    let vectors = provider.embed_batch(&texts).await?;
    if vectors.len() != chunks.len() {
        return Err(KbError::Embedding(format!(
            "expected {} vectors, got {}",
            chunks.len(),
            vectors.len()
        )));
    }

    let oversized_chunks = chunks
        .iter()
        .filter(|c| c.content.chars().count() > options.max_chunk_size + options.overlap_size)
        .count();

    let records: Vec<ChunkRecord> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(c, vector)| {
            ChunkRecord::new(
                Uuid::new_v4().to_string(),
                document.id.clone(),
                c.chunk_index,
                c.content,
            )
            .with_document_title(document.title.clone())
            .with_heading(c.heading)
            .with_metadata(json!({
                "section_path": c.section_path,
                "heading_level": c.heading_level,
            }))
            .with_embedding(vector)
        })
        .collect();

    let chunk_count = records.len();
    backend
        .replace_document_chunks(&document.id, records)
        .await?;

    tracing::debug!(
        document_id = %document.id,
        chunk_count,
        oversized_chunks,
        model = provider.model_name(),
        "document ingested"
    );

    Ok(IngestionSummary {
        document_id: document.id.clone(),
        chunk_count,
        oversized_chunks,
    })
}
