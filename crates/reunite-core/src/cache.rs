//! Lazy per-record memoization of reference-image descriptors.
//!
//! An entry is keyed by the SHA-256 of the image it came from and by the
//! extractor's model id, so replacing a photo or switching models makes the
//! old entry invisible without any explicit invalidation pass.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::error::StoreError;
use crate::extractor::{DescriptorExtractor, ExtractError};
use crate::store::GalleryStore;
use crate::types::{CachedDescriptor, Descriptor, ImageRef, MissingPersonRecord, RecordId};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record {id}: {source}")]
    Extraction {
        id: RecordId,
        #[source]
        source: ExtractError,
    },
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub extractions: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    extractions: AtomicU64,
    failures: AtomicU64,
}

pub struct DescriptorCache {
    extractor: Arc<dyn DescriptorExtractor>,
    /// Per-record extraction guards. The map lock is only held to look a
    /// guard up, never across an extraction.
    inflight: Mutex<HashMap<RecordId, Arc<Mutex<()>>>>,
    counters: Counters,
}

impl DescriptorCache {
    pub fn new(extractor: Arc<dyn DescriptorExtractor>) -> Self {
        Self {
            extractor,
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn extractor(&self) -> &Arc<dyn DescriptorExtractor> {
        &self.extractor
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.counters.hits.load(Ordering::Relaxed),
            extractions: self.counters.extractions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Descriptor for the record's current reference image.
    ///
    /// `Ok(None)` means the record cannot be matched: it has no image, the
    /// image does not decode, or no face was found. That outcome is cached.
    /// Errors are transient (unreadable image, extractor failure) and are not.
    pub fn get_descriptor(
        &self,
        store: &dyn GalleryStore,
        record: &MissingPersonRecord,
    ) -> Result<Option<Descriptor>, CacheError> {
        if record.reference_image.is_none() {
            return Ok(None);
        }
        if let Some(cached) = record.cached_descriptor(self.extractor.model_id()) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.descriptor.clone());
        }

        let guard = self.guard_for(record.id);
        let result = {
            let _held = guard.lock().unwrap_or_else(PoisonError::into_inner);
            self.refresh(store, record.id)
        };
        self.release_guard(record.id, guard);
        result
    }

    /// Re-read the record under its guard; a concurrent caller may have
    /// filled the entry while we waited.
    fn refresh(
        &self,
        store: &dyn GalleryStore,
        id: RecordId,
    ) -> Result<Option<Descriptor>, CacheError> {
        let Some(current) = store.get(id)? else {
            return Ok(None);
        };
        let Some(image) = current.reference_image.clone() else {
            return Ok(None);
        };
        if let Some(cached) = current.cached_descriptor(self.extractor.model_id()) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.descriptor.clone());
        }
        self.compute(store, id, &image)
    }

    fn compute(
        &self,
        store: &dyn GalleryStore,
        id: RecordId,
        image: &ImageRef,
    ) -> Result<Option<Descriptor>, CacheError> {
        let bytes = store.load_image(image).map_err(|err| {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            err
        })?;

        self.counters.extractions.fetch_add(1, Ordering::Relaxed);
        let descriptor = match self.extractor.extract(&bytes) {
            Ok(faces) => {
                tracing::debug!(%id, faces = faces.len(), "reference image extracted");
                // Index 0 is the detector's top-ranked face.
                faces.into_iter().next()
            }
            Err(ExtractError::Decode(err)) => {
                tracing::warn!(%id, error = %err, "reference image does not decode; record excluded");
                None
            }
            Err(source) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::Extraction { id, source });
            }
        };

        let entry = CachedDescriptor {
            model_id: self.extractor.model_id().to_string(),
            source_digest: image.digest.clone(),
            descriptor,
        };
        if store.store_descriptor(id, &entry)? {
            Ok(entry.descriptor)
        } else {
            tracing::warn!(%id, "reference image changed during extraction; result discarded");
            Ok(None)
        }
    }

    fn guard_for(&self, id: RecordId) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.entry(id).or_default().clone()
    }

    fn release_guard(&self, id: RecordId, guard: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only made and dropped under the map lock, so a count of
        // one means nobody else is waiting on this record.
        drop(guard);
        if inflight.get(&id).is_some_and(|g| Arc::strong_count(g) == 1) {
            inflight.remove(&id);
        }
    }
}
