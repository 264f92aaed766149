//! Image pool: a content-addressed-by-category cache of generated slide
//! images.
//!
//! Generating a slide image is a paid external call, so images are pooled
//! under a `{slide_type}_{topic_bucket}` category and reused across users.
//! Two guarantees matter here: a user is never served the same pooled
//! image twice (the usage table is the per-user exclusion set), and reuse
//! spreads across the pool (lowest usage count preferred, oldest entry on
//! ties). Recording a serve is transactional: the usage record and the
//! usage-count increment apply together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::KbError;

/// Fixed topic-keyword table, matched in order; ties favor the earlier
/// bucket. The order is part of the category contract — changing it
/// changes category assignment for existing pools.
pub const TOPIC_BUCKETS: &[(&str, &[&str])] = &[
    (
        "tech",
        &[
            "software", "tech", "digital", "app", "platform", "saas", "cloud", "ai", "data",
            "api", "cyber", "automation",
        ],
    ),
    (
        "business",
        &[
            "business", "strategy", "market", "growth", "customer", "sales", "revenue",
            "startup", "churn", "team",
        ],
    ),
    (
        "finance",
        &[
            "finance", "investment", "bank", "capital", "funding", "budget", "profit",
            "stock", "loan", "insurance",
        ],
    ),
    (
        "health",
        &[
            "health", "medical", "patient", "clinic", "wellness", "pharma", "hospital",
            "therapy", "diagnosis",
        ],
    ),
    (
        "education",
        &[
            "education", "learning", "student", "school", "course", "training",
            "university", "teacher", "curriculum",
        ],
    ),
    (
        "energy",
        &[
            "energy", "solar", "renewable", "power", "grid", "battery", "oil", "carbon",
            "wind",
        ],
    ),
    (
        "retail",
        &[
            "retail", "store", "shopping", "ecommerce", "commerce", "merchant",
            "inventory", "brand", "checkout",
        ],
    ),
    (
        "media",
        &[
            "media", "content", "video", "streaming", "social", "news", "entertainment",
            "audience", "podcast",
        ],
    ),
    (
        "manufacturing",
        &[
            "manufacturing", "factory", "production", "supply", "industrial", "assembly",
            "logistics", "machinery",
        ],
    ),
];

const FALLBACK_BUCKET: &str = "general";

/// Derives the pool category for a slide image request.
///
/// Lower-cases `text`, counts whole-word keyword hits per bucket, and picks
/// the bucket with the most matches; ties keep the first bucket in
/// [`TOPIC_BUCKETS`] order, and zero hits fall back to `general`. Pure and
/// deterministic.
pub fn derive_category(slide_type: &str, text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut best: Option<(&str, usize)> = None;
    for (bucket, keywords) in TOPIC_BUCKETS {
        let hits = keywords
            .iter()
            .filter(|kw| contains_word(&lowered, kw))
            .count();
        if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
            best = Some((bucket, hits));
        }
    }
    let bucket = best.map_or(FALLBACK_BUCKET, |(bucket, _)| bucket);
    format!("{slide_type}_{bucket}")
}

/// Substring match bounded by non-alphanumeric characters on both sides,
/// so "ai" does not hit "maintain" and "tech" does not hit "biotech".
fn contains_word(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(start, matched)| {
        let before = text[..start].chars().next_back();
        let after = text[start + matched.len()..].chars().next();
        before.map_or(true, |c| !c.is_alphanumeric())
            && after.map_or(true, |c| !c.is_alphanumeric())
    })
}

/// A reusable generated image. `usage_count` only ever grows; `category`
/// is assigned at creation and never changed. Entries reference object
/// storage by key, never bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePoolEntry {
    pub id: String,
    pub category: String,
    pub storage_key: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Marks that a user has been served a pooled image; the exclusion set for
/// that user's future cache lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUsageRecord {
    pub user_id: String,
    pub image_pool_id: String,
    pub slide_id: Option<String>,
    pub served_at: DateTime<Utc>,
}

/// Storage operations backing the pool.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Best entry in `category` the user has not seen: lowest usage count,
    /// oldest on ties.
    async fn find_available_entry(
        &self,
        category: &str,
        user_id: &str,
    ) -> Result<Option<ImagePoolEntry>, KbError>;

    async fn insert_entry(&self, entry: &ImagePoolEntry) -> Result<(), KbError>;

    /// Atomically insert the usage record and increment the entry's usage
    /// count. A failure of either part must leave both unapplied.
    async fn record_usage(
        &self,
        user_id: &str,
        entry_id: &str,
        slide_id: Option<&str>,
    ) -> Result<(), KbError>;
}

/// Pool facade over an injected [`PoolBackend`] handle.
pub struct ImagePool<S> {
    store: S,
}

impl<S: PoolBackend> ImagePool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Cached image for `category` not yet seen by `user_id`, or `None`.
    pub async fn find_cached_image(
        &self,
        category: &str,
        user_id: &str,
    ) -> Result<Option<ImagePoolEntry>, KbError> {
        if category.trim().is_empty() {
            return Err(KbError::InvalidInput("category is empty".into()));
        }
        if user_id.trim().is_empty() {
            return Err(KbError::InvalidInput("user_id is empty".into()));
        }
        self.store.find_available_entry(category, user_id).await
    }

    /// Unconditional insert: every generated image becomes a new pool
    /// entry, no content dedup. Returns the new entry's id.
    pub async fn add_to_pool(
        &self,
        category: &str,
        storage_key: &str,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<String, KbError> {
        if category.trim().is_empty() {
            return Err(KbError::InvalidInput("category is empty".into()));
        }
        let entry = ImagePoolEntry {
            id: Uuid::new_v4().to_string(),
            category: category.to_string(),
            storage_key: storage_key.to_string(),
            prompt: prompt.to_string(),
            width,
            height,
            usage_count: 0,
            created_at: Utc::now(),
        };
        self.store.insert_entry(&entry).await?;
        tracing::debug!(id = %entry.id, category, "added image to pool");
        Ok(entry.id)
    }

    /// Records a serve. Not safe to blindly retry: a duplicate
    /// `(user, entry)` pair is rejected by the backend's unique constraint
    /// rather than double-counted.
    pub async fn record_usage(
        &self,
        user_id: &str,
        entry_id: &str,
        slide_id: Option<&str>,
    ) -> Result<(), KbError> {
        self.store.record_usage(user_id, entry_id, slide_id).await
    }
}
