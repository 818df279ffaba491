use thiserror::Error;

use crate::types::RecordId;

/// Image bytes are not in a processable format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not process image: {0}")]
pub struct DecodeError(pub String);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("image unavailable at {location}: {source}")]
    ImageUnavailable {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}
