//! Embedding providers: the bridge from text to fixed-length vectors.
//!
//! [`EmbeddingProvider`] is the seam the rest of the pipeline depends on.
//! [`HttpEmbeddingProvider`] talks to an OpenAI-style `{model, input}`
//! endpoint with request batching; [`MockEmbeddingProvider`] produces
//! deterministic vectors for CI and tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::KbError;

/// Hard upper bound on items per provider call.
pub const MAX_BATCH_SIZE: usize = 100;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Converts text into fixed-length embedding vectors.
///
/// `embed_batch` returns one vector per input, in input order. Failure of
/// any underlying provider call fails the whole batch; nothing is silently
/// dropped. Calls are idempotent and safe for the caller to retry with
/// backoff.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, KbError>;

    /// Embed many texts, preserving order. An empty input returns an empty
    /// vector without any network call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError>;

    /// Name of the embedding model, recorded for provenance.
    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Provider speaking the OpenAI-compatible embeddings wire shape.
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    batch_size: usize,
    timeout: Duration,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            batch_size: MAX_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Items per provider call. Clamped to [`MAX_BATCH_SIZE`].
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: batch,
        };
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let parsed: EmbeddingResponse = response.json().await?;

        if parsed.data.len() != batch.len() {
            return Err(KbError::Embedding(format!(
                "provider returned {} vectors for {} inputs",
                parsed.data.len(),
                batch.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if let Some(first) = vectors.first() {
            let dim = first.len();
            if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
                return Err(KbError::Embedding(
                    "provider returned vectors of inconsistent dimension".into(),
                ));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, KbError> {
        let vectors = self.call(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| KbError::Embedding("provider returned no vector".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            tracing::debug!(batch_len = batch.len(), model = %self.model, "embedding batch");
            let mut batch_vectors = self.call(batch).await?;
            vectors.append(&mut batch_vectors);
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic hash-derived embeddings for tests and offline runs.
///
/// Identical text always produces the identical unit-length vector;
/// different text almost always differs.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self { dimension: 16 }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // FNV-1a over the bytes, then a splitmix-style expansion per lane.
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.bytes() {
            state ^= u64::from(byte);
            state = state.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|lane| {
                let mut x = state ^ (lane as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
                x ^= x >> 33;
                x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
                x ^= x >> 33;
                (x as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0
            })
            .collect();
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, KbError> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }
}
