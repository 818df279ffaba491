//! Photo search: query image in, matching record or "no match" out.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::DescriptorCache;
use crate::error::StoreError;
use crate::extractor::{DescriptorExtractor, ExtractError};
use crate::matcher::{MatchConfig, MatchEngine, MatchResult};
use crate::store::GalleryStore;
use crate::types::Descriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    DecodeFailed,
    NoFaceDetected,
    ExtractionFailed,
    GalleryUnavailable,
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("failed to process uploaded image: {0}")]
    DecodeFailed(String),
    #[error("no face found in uploaded image")]
    NoFaceDetected,
    #[error("descriptor extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("gallery unavailable: {0}")]
    Gallery(#[from] StoreError),
}

impl QueryError {
    pub fn kind(&self) -> QueryErrorKind {
        match self {
            Self::DecodeFailed(_) => QueryErrorKind::DecodeFailed,
            Self::NoFaceDetected => QueryErrorKind::NoFaceDetected,
            Self::ExtractionFailed(_) => QueryErrorKind::ExtractionFailed,
            Self::Gallery(_) => QueryErrorKind::GalleryUnavailable,
        }
    }
}

impl From<ExtractError> for QueryError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Decode(e) => Self::DecodeFailed(e.0),
            other => Self::ExtractionFailed(other.to_string()),
        }
    }
}

/// Search front door. Built once and shared; holds the extractor, the
/// descriptor cache and the match engine over one gallery.
pub struct FaceSearch {
    extractor: Arc<dyn DescriptorExtractor>,
    engine: MatchEngine,
}

impl FaceSearch {
    pub fn new(
        store: Arc<dyn GalleryStore>,
        extractor: Arc<dyn DescriptorExtractor>,
        config: MatchConfig,
    ) -> Self {
        let cache = Arc::new(DescriptorCache::new(extractor.clone()));
        Self { extractor, engine: MatchEngine::new(store, cache, config) }
    }

    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    pub fn model_id(&self) -> &str {
        self.extractor.model_id()
    }

    /// Descriptor of the top-ranked face in the query image.
    pub fn describe(&self, image: &[u8]) -> Result<Descriptor, QueryError> {
        let faces = self.extractor.extract(image)?;
        tracing::debug!(faces = faces.len(), "query image extracted");
        faces.into_iter().next().ok_or(QueryError::NoFaceDetected)
    }

    pub fn find(&self, query: &Descriptor) -> Result<Option<MatchResult>, QueryError> {
        let threshold = self.engine.config().threshold;
        let result = self.engine.find_match(query)?;
        match &result {
            Some(m) => tracing::info!(id = %m.record.id, distance = m.distance, threshold, "match found"),
            None => tracing::info!(threshold, "no match found"),
        }
        Ok(result)
    }

    pub fn match_image(&self, image: &[u8]) -> Result<Option<MatchResult>, QueryError> {
        let query = self.describe(image)?;
        self.find(&query)
    }
}
