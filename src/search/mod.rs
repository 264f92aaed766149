//! Query-time retrieval: embed the query, run vector similarity search,
//! apply the relevance threshold and topK cutoff, then optionally rerank.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingProvider;
use crate::rerank::Reranker;
use crate::stores::VectorBackend;
use crate::types::KbError;

/// One retrieval hit, produced fresh per query. `similarity` holds the
/// vector-store score until a successful rerank replaces it with the
/// reranker's relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub content: String,
    pub heading: Option<String>,
    pub document_id: String,
    pub document_title: String,
    pub similarity: f32,
}

/// Retrieval facade over an embedding provider, a vector backend, and an
/// optional reranker. Holds no mutable state; safe to share across
/// concurrent requests.
pub struct Retriever<B> {
    provider: Arc<dyn EmbeddingProvider>,
    backend: B,
    reranker: Option<Reranker>,
    rerank_min_score: f32,
}

impl<B: VectorBackend> Retriever<B> {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, backend: B) -> Self {
        Self {
            provider,
            backend,
            reranker: None,
            rerank_min_score: 0.0,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Minimum reranker relevance score; entries below it are dropped on a
    /// successful rerank. Distinct from the vector-stage `min_score`
    /// because the two scores live on different scales.
    #[must_use]
    pub fn with_rerank_min_score(mut self, min_score: f32) -> Self {
        self.rerank_min_score = min_score;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns up to `top_k` results with similarity >= `min_score`,
    /// descending. An empty index yields an empty result, not an error.
    /// Rerank failures never surface here; the results simply keep their
    /// pre-rerank ordering.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, KbError> {
        if query.trim().is_empty() {
            return Err(KbError::InvalidInput("query is empty".into()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.provider.embed(query).await?;
        let hits = self.backend.search_similar(&query_embedding, top_k).await?;

        let results: Vec<SearchResult> = hits
            .into_iter()
            .filter(|(_, similarity)| *similarity >= min_score)
            .map(|(record, similarity)| SearchResult {
                chunk_id: record.id,
                content: record.content,
                heading: record.heading,
                document_id: record.document_id,
                document_title: record.document_title,
                similarity,
            })
            .collect();

        tracing::debug!(count = results.len(), top_k, "vector search complete");

        match &self.reranker {
            Some(reranker) => Ok(reranker
                .rerank(query, results, top_k, self.rerank_min_score)
                .await
                .into_results()),
            None => Ok(results),
        }
    }
}
