//! reunite-core — Missing-person gallery and face matching.
//!
//! Reference photos are turned into descriptors lazily by a
//! [`DescriptorExtractor`], memoized per record by [`DescriptorCache`], and
//! scanned in registration order by [`MatchEngine`].

pub mod cache;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod matcher;
pub mod query;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{CacheCounters, CacheError, DescriptorCache};
pub use error::{DecodeError, StoreError};
pub use extractor::{DescriptorExtractor, ExtractError};
pub use ingest::{IngestionPipeline, RegisterError, RegistrationForm, ValidationError};
pub use matcher::{DistanceMetric, MatchConfig, MatchEngine, MatchPolicy, MatchResult, ScanSummary};
pub use query::{FaceSearch, QueryError, QueryErrorKind};
pub use store::{GalleryStore, MemoryGallery};
pub use types::{
    CachedDescriptor, Descriptor, ImageRef, ImageUpload, MatchPayload, MissingPersonRecord,
    NewRecord, RecordId,
};
