//! End-to-end retrieval tests: ingest with mock embeddings into an
//! in-memory sqlite-vec store, then search and rerank.

use std::sync::Arc;

use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::json;

use deckbase::{
    ingest_document, ChunkOptions, ChunkRecord, DocumentInput, EmbeddingProvider,
    HttpEmbeddingProvider, KbError, MockEmbeddingProvider, Reranker, Retriever, SqliteKbStore,
    VectorBackend,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Provider returning one fixed vector for every input; lets tests pick
/// the query vector exactly.
struct FixedProvider(Vec<f32>);

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, KbError> {
        Ok(self.0.clone())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

fn record(id: &str, content: &str, embedding: Vec<f32>) -> ChunkRecord {
    ChunkRecord::new(id, "doc-1", 0, content)
        .with_document_title("Doc One")
        .with_embedding(embedding)
}

#[tokio::test]
async fn search_orders_by_similarity_and_applies_min_score() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![
            record("exact", "exact match", vec![1.0, 0.0, 0.0, 0.0]),
            record("close", "close match", vec![0.95, 0.3122, 0.0, 0.0]),
            record("orthogonal", "unrelated", vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider(vec![1.0, 0.0, 0.0, 0.0]));
    let retriever = Retriever::new(provider, store);

    let results = retriever.search("query", 10, 0.5).await.unwrap();
    assert_eq!(results.len(), 2, "orthogonal chunk must fall below 0.5");
    assert_eq!(results[0].chunk_id, "exact");
    assert!(results[0].similarity > 0.99);
    assert_eq!(results[1].chunk_id, "close");
    assert!(results[1].similarity < results[0].similarity);
    assert_eq!(results[0].document_title, "Doc One");
}

#[tokio::test]
async fn search_ties_break_by_insertion_order() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![
            record("first", "same vector", vec![0.6, 0.8, 0.0]),
            record("second", "same vector too", vec![0.6, 0.8, 0.0]),
        ])
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider(vec![0.6, 0.8, 0.0]));
    let retriever = Retriever::new(provider, store);

    let results = retriever.search("query", 10, 0.0).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk_id, "first");
    assert_eq!(results[1].chunk_id, "second");
}

#[tokio::test]
async fn search_against_empty_index_returns_empty() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    let provider = Arc::new(FixedProvider(vec![1.0, 0.0]));
    let retriever = Retriever::new(provider, store);

    let results = retriever.search("anything", 5, 0.0).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn mixed_embedding_dimensions_are_rejected() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![record("a", "a", vec![1.0, 0.0, 0.0])])
        .await
        .unwrap();

    let err = store
        .insert_chunks(vec![record("b", "b", vec![1.0, 0.0])])
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::Storage(_)));

    let err = store.search_similar(&[1.0, 0.0], 5).await.unwrap_err();
    assert!(matches!(err, KbError::Storage(_)));
}

#[tokio::test]
async fn ingest_indexes_every_chunk_and_reingest_replaces() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    let provider = MockEmbeddingProvider::with_dimension(8);

    let text = format!(
        "# Overview\n{}\n\n## Pricing\n{}\n\n## Roadmap\n{}",
        "The platform ingests pitch documents. ".repeat(12),
        "Plans start at a flat monthly rate. ".repeat(12),
        "Multi-deck support lands next quarter. ".repeat(12)
    );
    let document = DocumentInput::new("doc-9", "Pitch KB", text);
    let options = ChunkOptions {
        max_chunk_size: 400,
        min_chunk_size: 50,
        overlap_size: 40,
    };

    let summary = ingest_document(&store, &provider, &document, &options)
        .await
        .unwrap();
    assert!(summary.chunk_count > 1);
    assert_eq!(summary.chunk_count, store.count().await.unwrap());

    let stored = store.get_chunks_by_document("doc-9").await.unwrap();
    for (expected, chunk) in stored.iter().enumerate() {
        assert_eq!(chunk.chunk_index, expected);
        assert_eq!(chunk.document_title, "Pitch KB");
    }
    assert!(stored
        .iter()
        .any(|c| c.heading.as_deref() == Some("Pricing")));

    // Re-ingestion replaces the full chunk set, not a diff.
    let smaller = DocumentInput::new("doc-9", "Pitch KB", "# Overview\nJust one short section.");
    let summary = ingest_document(&store, &provider, &smaller, &options)
        .await
        .unwrap();
    assert_eq!(summary.chunk_count, 1);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_a_document_removes_chunks_and_embeddings() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![record("a", "to be removed", vec![1.0, 0.0])])
        .await
        .unwrap();
    store
        .insert_chunks(vec![ChunkRecord::new("z", "doc-2", 0, "other doc")
            .with_embedding(vec![0.0, 1.0])])
        .await
        .unwrap();

    let deleted = store.delete_chunks_by_document("doc-1").await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.count().await.unwrap(), 1);
    // The removed document's vector must be gone from the index too.
    let hits = store.search_similar(&[1.0, 0.0], 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, "z");
}

#[tokio::test]
async fn failed_reingest_keeps_previous_chunk_set() {
    let store = SqliteKbStore::open_in_memory().await.unwrap();
    let options = ChunkOptions::default();

    // A second document anchors the store's embedding dimension at 8.
    let anchor = DocumentInput::new("doc-anchor", "Anchor", "# A\nanchor content");
    ingest_document(
        &store,
        &MockEmbeddingProvider::with_dimension(8),
        &anchor,
        &options,
    )
    .await
    .unwrap();

    let document = DocumentInput::new("doc-b", "Doc B", "# B\ncontent indexed at dimension 8");
    ingest_document(
        &store,
        &MockEmbeddingProvider::with_dimension(8),
        &document,
        &options,
    )
    .await
    .unwrap();
    let before = store.get_chunks_by_document("doc-b").await.unwrap();
    assert!(!before.is_empty());

    // Re-embedding with a mismatched-dimension provider fails the replace;
    // the document's previous index must survive the failure.
    let err = ingest_document(
        &store,
        &MockEmbeddingProvider::with_dimension(4),
        &document,
        &options,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, KbError::Storage(_)));

    let after = store.get_chunks_by_document("doc-b").await.unwrap();
    assert_eq!(after.len(), before.len());
    assert_eq!(after[0].content, before[0].content);
}

#[tokio::test]
async fn file_backed_store_persists_across_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kb.sqlite");
    {
        let store = SqliteKbStore::open(&path).await.unwrap();
        store
            .insert_chunks(vec![record("p1", "persisted content", vec![1.0, 0.0])])
            .await
            .unwrap();
    }

    let store = SqliteKbStore::open(&path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
    let hits = store.search_similar(&[1.0, 0.0], 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, "p1");
    assert!(hits[0].1 > 0.99);
}

#[tokio::test]
async fn failed_embedding_leaves_store_untouched() {
    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, KbError> {
            Err(KbError::Embedding("provider down".into()))
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
            Err(KbError::Embedding("provider down".into()))
        }
        fn model_name(&self) -> &str {
            "failing"
        }
    }

    let store = SqliteKbStore::open_in_memory().await.unwrap();
    let good = MockEmbeddingProvider::new();
    let document = DocumentInput::new("doc-2", "Doc", "# A\nsome stable content here");
    ingest_document(&store, &good, &document, &ChunkOptions::default())
        .await
        .unwrap();
    let before = store.count().await.unwrap();

    let err = ingest_document(&store, &FailingProvider, &document, &ChunkOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::Embedding(_)));
    assert_eq!(
        store.count().await.unwrap(),
        before,
        "failed ingestion must not leave a half-indexed document"
    );
}

#[tokio::test]
async fn http_provider_batches_and_preserves_order() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/embeddings")
                .json_body(json!({"model": "embed-1", "input": ["a", "b"]}));
            then.status(200).json_body(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            }));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/embeddings")
                .json_body(json!({"model": "embed-1", "input": ["c"]}));
            then.status(200).json_body(json!({
                "data": [{"index": 0, "embedding": [0.5, 0.5]}]
            }));
        })
        .await;

    let provider = HttpEmbeddingProvider::new(server.url("/v1/embeddings"), "embed-1")
        .with_batch_size(2);
    let inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let vectors = provider.embed_batch(&inputs).await.unwrap();

    first.assert_async().await;
    second.assert_async().await;
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]);
}

#[tokio::test]
async fn http_provider_fails_whole_batch_on_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(500);
        })
        .await;

    let provider = HttpEmbeddingProvider::new(server.url("/v1/embeddings"), "embed-1");
    let inputs = vec!["a".to_string(), "b".to_string()];
    assert!(provider.embed_batch(&inputs).await.is_err());
}

#[tokio::test]
async fn reranker_failure_keeps_full_prerank_results() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rerank");
            then.status(500);
        })
        .await;

    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![
            record("a", "first", vec![1.0, 0.0, 0.0]),
            record("b", "second", vec![0.9, 0.436, 0.0]),
            record("c", "third", vec![0.8, 0.6, 0.0]),
        ])
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider(vec![1.0, 0.0, 0.0]));
    let reranker = Reranker::new(server.url("/rerank"), "rerank-1").with_api_key("key");
    let retriever = Retriever::new(provider, store).with_reranker(reranker);

    let results = retriever.search("query", 10, 0.0).await.unwrap();
    // Degraded search: pre-rerank ordering, nothing trimmed.
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].chunk_id, "a");
    assert_eq!(results[1].chunk_id, "b");
    assert_eq!(results[2].chunk_id, "c");
}

#[tokio::test]
async fn reranker_success_reorders_and_replaces_scores() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rerank");
            then.status(200).json_body(json!({
                "results": [
                    {"index": 2, "relevance_score": 0.97},
                    {"index": 0, "relevance_score": 0.55},
                    {"index": 1, "relevance_score": 0.10}
                ]
            }));
        })
        .await;

    let store = SqliteKbStore::open_in_memory().await.unwrap();
    store
        .insert_chunks(vec![
            record("a", "first", vec![1.0, 0.0, 0.0]),
            record("b", "second", vec![0.9, 0.436, 0.0]),
            record("c", "third", vec![0.8, 0.6, 0.0]),
        ])
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider(vec![1.0, 0.0, 0.0]));
    let reranker = Reranker::new(server.url("/rerank"), "rerank-1").with_api_key("key");
    let retriever = Retriever::new(provider, store)
        .with_reranker(reranker)
        .with_rerank_min_score(0.3);

    let results = retriever.search("query", 10, 0.0).await.unwrap();
    assert_eq!(results.len(), 2, "entry below rerank min_score is dropped");
    assert_eq!(results[0].chunk_id, "c");
    assert!((results[0].similarity - 0.97).abs() < 1e-6);
    assert_eq!(results[1].chunk_id, "a");
}
