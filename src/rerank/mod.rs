//! Second-pass relevance reordering with a remote reranking model.
//!
//! Reranking is a quality enhancement, not a correctness requirement, so
//! this module is fail-open end to end: any remote failure (timeout, 5xx,
//! malformed body, out-of-range indices) degrades to returning the caller's
//! results unchanged, in original order, untrimmed. The contract is made
//! visible in the type system via [`RerankOutcome`] rather than hidden in
//! exception paths.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::search::SearchResult;
use crate::types::KbError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of a rerank attempt.
///
/// `Enhanced` carries reordered, score-filtered, topK-capped results;
/// `Unchanged` carries the original results exactly as submitted.
#[derive(Debug, Clone)]
pub enum RerankOutcome {
    Enhanced(Vec<SearchResult>),
    Unchanged(Vec<SearchResult>),
}

impl RerankOutcome {
    pub fn into_results(self) -> Vec<SearchResult> {
        match self {
            RerankOutcome::Enhanced(results) | RerankOutcome::Unchanged(results) => results,
        }
    }

    pub fn is_enhanced(&self) -> bool {
        matches!(self, RerankOutcome::Enhanced(_))
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

#[derive(Deserialize)]
struct RerankEntry {
    index: usize,
    relevance_score: f32,
}

/// Client for a Cohere-style `{model, query, documents, top_n}` reranking
/// endpoint. Disabled (identity no-op) when no API key is configured.
#[derive(Clone)]
pub struct Reranker {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl Reranker {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Reorders `results` by remote relevance score, dropping entries below
    /// `min_score` and capping at `top_k`.
    ///
    /// Identity no-op when disabled or when there is at most one result.
    /// Never fails: every remote error path returns
    /// [`RerankOutcome::Unchanged`] with the original results.
    pub async fn rerank(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        top_k: usize,
        min_score: f32,
    ) -> RerankOutcome {
        if !self.is_enabled() || results.len() <= 1 {
            return RerankOutcome::Unchanged(results);
        }

        let response =
            tokio::time::timeout(self.timeout, self.call(query, &results, top_k)).await;
        let ranked = match response {
            Ok(Ok(ranked)) => ranked,
            Ok(Err(err)) => {
                tracing::warn!(%err, "rerank call failed, keeping original order");
                return RerankOutcome::Unchanged(results);
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "rerank call timed out, keeping original order");
                return RerankOutcome::Unchanged(results);
            }
        };

        match apply_ranking(&results, ranked, top_k, min_score) {
            Ok(enhanced) => RerankOutcome::Enhanced(enhanced),
            Err(reason) => {
                tracing::warn!(%reason, "rejecting rerank response, keeping original order");
                RerankOutcome::Unchanged(results)
            }
        }
    }

    async fn call(
        &self,
        query: &str,
        results: &[SearchResult],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>, KbError> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents: results.iter().map(|r| r.content.as_str()).collect(),
            top_n: top_k,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        let parsed: RerankResponse = response.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|e| (e.index, e.relevance_score))
            .collect())
    }
}

/// Explicit parse-or-reject validation of a ranking against the submitted
/// result set. Out-of-range or duplicate indices reject the whole response.
fn apply_ranking(
    results: &[SearchResult],
    mut ranked: Vec<(usize, f32)>,
    top_k: usize,
    min_score: f32,
) -> Result<Vec<SearchResult>, String> {
    let mut seen = vec![false; results.len()];
    for &(index, _) in &ranked {
        let slot = seen
            .get_mut(index)
            .ok_or_else(|| format!("index {index} out of range for {} results", results.len()))?;
        if *slot {
            return Err(format!("duplicate index {index} in rerank response"));
        }
        *slot = true;
    }

    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(ranked
        .into_iter()
        .filter(|&(_, score)| score >= min_score)
        .take(top_k)
        .map(|(index, score)| {
            let mut result = results[index].clone();
            result.similarity = score;
            result
        })
        .collect())
}
