//! Boundary to the face descriptor model.

use std::time::Duration;
use thiserror::Error;

use crate::error::DecodeError;
use crate::types::Descriptor;

#[derive(Error, Debug, Clone)]
pub enum ExtractError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("descriptor extraction failed: {0}")]
    Failed(String),
    #[error("descriptor extraction timed out after {0:?}")]
    TimedOut(Duration),
}

/// Turns image bytes into one descriptor per detected face.
///
/// Descriptors come back in the detector's ranking order (best first) and
/// the sequence is empty when no face is found. Every descriptor from one
/// extractor has the same dimension; descriptors from different extractors
/// must not be compared, which is why each carries [`model_id`](Self::model_id).
pub trait DescriptorExtractor: Send + Sync {
    /// Stable identifier of the model, e.g. "w600k_r50".
    fn model_id(&self) -> &str;

    fn extract(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractError>;
}
