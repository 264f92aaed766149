//! ```text
//! Extracted document text ──► chunker::chunk ──► ordered DocumentChunks
//!                                     │
//! DocumentChunks ──► embeddings::EmbeddingProvider ──► chunk vectors
//!                                     │
//! ingestion::ingest_document ──► stores::SqliteKbStore (chunks + vectors)
//!
//! Query ──► search::Retriever ──► vector similarity ──► rerank::Reranker
//!                                                        (fail-open)
//!
//! Document change ──► staleness::StalenessTracker ──► affected slides
//! Slide image request ──► pool::ImagePool ──► cached entry or miss
//! ```
//!
pub mod chunker;
pub mod embeddings;
pub mod ingestion;
pub mod pool;
pub mod rerank;
pub mod search;
pub mod staleness;
pub mod stores;
pub mod types;

pub use chunker::{chunk, ChunkOptions, DocumentChunk};
pub use embeddings::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider};
pub use ingestion::{ingest_document, DocumentInput, IngestionSummary};
pub use pool::{derive_category, ImagePool, ImagePoolEntry, ImageUsageRecord};
pub use rerank::{Reranker, RerankOutcome};
pub use search::{Retriever, SearchResult};
pub use staleness::{AffectedSlide, SlideLink, StalenessTracker};
pub use stores::{ChunkRecord, SqliteKbStore, VectorBackend};
pub use types::KbError;
