//! Staleness tracking: which slides were generated from a changed document.
//!
//! When a document is re-uploaded, every slide citing one of its chunks is
//! potentially stale. This module traverses the slide-source link table
//! (owned by the external storage layer, read-only here) and reports each
//! affected slide once, with a count of how many of its source chunks came
//! from the document. It performs no mutation and triggers no regeneration
//! itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::KbError;

/// One row of the chunk→slide link table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideLink {
    pub chunk_id: String,
    pub slide_id: String,
    pub presentation_id: String,
    pub slide_title: String,
}

/// A slide whose generated content depended on the changed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedSlide {
    pub slide_id: String,
    pub presentation_id: String,
    pub slide_title: String,
    /// How many of the slide's source chunks belong to the document.
    pub chunk_count: usize,
}

/// Read access to slide-source links for a document's chunks.
#[async_trait]
pub trait SlideLinkSource: Send + Sync {
    async fn slide_links_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<SlideLink>, KbError>;
}

/// Groups links by slide, first-encountered order, one entry per slide.
pub fn group_affected_slides(links: &[SlideLink]) -> Vec<AffectedSlide> {
    let mut slides: Vec<AffectedSlide> = Vec::new();
    for link in links {
        match slides.iter_mut().find(|s| s.slide_id == link.slide_id) {
            Some(slide) => slide.chunk_count += 1,
            None => slides.push(AffectedSlide {
                slide_id: link.slide_id.clone(),
                presentation_id: link.presentation_id.clone(),
                slide_title: link.slide_title.clone(),
                chunk_count: 1,
            }),
        }
    }
    slides
}

/// Facade over a [`SlideLinkSource`]; pure read, no regeneration.
pub struct StalenessTracker<S> {
    store: S,
}

impl<S: SlideLinkSource> StalenessTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Every distinct slide supported by a chunk of `document_id`, each
    /// reported exactly once. No affected slides is an empty result, not
    /// an error.
    pub async fn find_affected_slides(
        &self,
        document_id: &str,
    ) -> Result<Vec<AffectedSlide>, KbError> {
        if document_id.trim().is_empty() {
            return Err(KbError::InvalidInput("document_id is empty".into()));
        }
        let links = self.store.slide_links_for_document(document_id).await?;
        Ok(group_affected_slides(&links))
    }
}
