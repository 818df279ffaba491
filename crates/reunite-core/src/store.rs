//! Gallery storage boundary and an in-memory implementation.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::error::StoreError;
use crate::types::{
    CachedDescriptor, ImageRef, ImageUpload, MissingPersonRecord, NewRecord, RecordId,
};

/// Durable collection of missing-person records.
///
/// Implementations must publish each record atomically: a concurrent
/// [`scan_with_images`](Self::scan_with_images) either sees a whole record or
/// nothing of it. Ids are assigned by the store, strictly increasing and never
/// reused.
pub trait GalleryStore: Send + Sync {
    fn insert(&self, record: NewRecord) -> Result<MissingPersonRecord, StoreError>;

    fn get(&self, id: RecordId) -> Result<Option<MissingPersonRecord>, StoreError>;

    /// Every record that has a reference image, in ascending id order.
    fn scan_with_images(&self) -> Result<Vec<MissingPersonRecord>, StoreError>;

    fn load_image(&self, image: &ImageRef) -> Result<Vec<u8>, StoreError>;

    /// Persist a cache entry, but only if the record still carries the image
    /// the entry was computed from. Returns whether the write was applied.
    fn store_descriptor(&self, id: RecordId, cached: &CachedDescriptor)
        -> Result<bool, StoreError>;

    /// Swap or remove the reference image. Always clears the cached descriptor.
    fn replace_image(
        &self,
        id: RecordId,
        image: Option<ImageUpload>,
    ) -> Result<MissingPersonRecord, StoreError>;

    fn remove(&self, id: RecordId) -> Result<bool, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    last_id: u64,
    records: BTreeMap<RecordId, MissingPersonRecord>,
    images: HashMap<String, Vec<u8>>,
}

impl MemoryInner {
    fn put_image(&mut self, upload: ImageUpload) -> ImageRef {
        let image = upload.image_ref();
        self.images.insert(image.location.clone(), upload.bytes);
        image
    }

    /// Images are content-addressed and may be shared between records.
    fn release_image(&mut self, image: &ImageRef) {
        let in_use = self
            .records
            .values()
            .any(|r| r.reference_image.as_ref() == Some(image));
        if !in_use {
            self.images.remove(&image.location);
        }
    }
}

/// Process-local gallery. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryGallery {
    inner: RwLock<MemoryInner>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn forget_image(&self, location: &str) {
        self.write().images.remove(location);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GalleryStore for MemoryGallery {
    fn insert(&self, record: NewRecord) -> Result<MissingPersonRecord, StoreError> {
        let mut inner = self.write();
        inner.last_id += 1;
        let id = RecordId(inner.last_id);
        let reference_image = record.reference_image.map(|upload| inner.put_image(upload));

        let stored = MissingPersonRecord {
            id,
            full_name: record.full_name,
            contact_info: record.contact_info,
            reporter_address: record.reporter_address,
            missing_place_address: record.missing_place_address,
            identity_details: record.identity_details,
            reference_image,
            descriptor: None,
            created_at: Utc::now(),
        };
        inner.records.insert(id, stored.clone());
        Ok(stored)
    }

    fn get(&self, id: RecordId) -> Result<Option<MissingPersonRecord>, StoreError> {
        Ok(self.read().records.get(&id).cloned())
    }

    fn scan_with_images(&self) -> Result<Vec<MissingPersonRecord>, StoreError> {
        Ok(self
            .read()
            .records
            .values()
            .filter(|r| r.reference_image.is_some())
            .cloned()
            .collect())
    }

    fn load_image(&self, image: &ImageRef) -> Result<Vec<u8>, StoreError> {
        self.read()
            .images
            .get(&image.location)
            .cloned()
            .ok_or_else(|| StoreError::ImageUnavailable {
                location: image.location.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    fn store_descriptor(
        &self,
        id: RecordId,
        cached: &CachedDescriptor,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write();
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(false);
        };
        match &record.reference_image {
            Some(image) if image.digest == cached.source_digest => {
                record.descriptor = Some(cached.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn replace_image(
        &self,
        id: RecordId,
        image: Option<ImageUpload>,
    ) -> Result<MissingPersonRecord, StoreError> {
        let mut inner = self.write();
        if !inner.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let new_ref = image.map(|upload| inner.put_image(upload));

        let Some(record) = inner.records.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        let old_ref = std::mem::replace(&mut record.reference_image, new_ref);
        record.descriptor = None;
        let updated = record.clone();

        if let Some(old) = old_ref.filter(|old| Some(old) != updated.reference_image.as_ref()) {
            inner.release_image(&old);
        }
        Ok(updated)
    }

    fn remove(&self, id: RecordId) -> Result<bool, StoreError> {
        let mut inner = self.write();
        match inner.records.remove(&id) {
            Some(record) => {
                if let Some(image) = &record.reference_image {
                    inner.release_image(image);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read().records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_record, png};

    #[test]
    fn test_ids_ascend_and_are_not_reused() {
        let store = MemoryGallery::new();
        let a = store.insert(new_record("A", None)).unwrap();
        let b = store.insert(new_record("B", None)).unwrap();
        assert!(a.id < b.id);

        assert!(store.remove(b.id).unwrap());
        let c = store.insert(new_record("C", None)).unwrap();
        assert!(c.id > b.id);
    }

    #[test]
    fn test_scan_excludes_records_without_image() {
        let store = MemoryGallery::new();
        store.insert(new_record("no photo", None)).unwrap();
        let with = store.insert(new_record("photo", Some(png("a")))).unwrap();

        let scanned = store.scan_with_images().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].id, with.id);
    }

    #[test]
    fn test_store_descriptor_rejects_stale_digest() {
        let store = MemoryGallery::new();
        let record = store.insert(new_record("A", Some(png("a")))).unwrap();
        let stale = CachedDescriptor {
            model_id: "fake".into(),
            source_digest: "not-the-current-image".into(),
            descriptor: None,
        };
        assert!(!store.store_descriptor(record.id, &stale).unwrap());
        assert!(store.get(record.id).unwrap().unwrap().descriptor.is_none());
    }

    #[test]
    fn test_replace_image_clears_descriptor_and_releases_blob() {
        let store = MemoryGallery::new();
        let record = store.insert(new_record("A", Some(png("old")))).unwrap();
        let old = record.reference_image.clone().unwrap();
        let cached = CachedDescriptor {
            model_id: "fake".into(),
            source_digest: old.digest.clone(),
            descriptor: None,
        };
        assert!(store.store_descriptor(record.id, &cached).unwrap());

        let upload = ImageUpload::new(png("new")).unwrap();
        let updated = store.replace_image(record.id, Some(upload)).unwrap();
        assert!(updated.descriptor.is_none());
        assert_ne!(updated.reference_image.as_ref(), Some(&old));
        assert!(store.load_image(&old).is_err());
    }

    #[test]
    fn test_replace_image_unknown_record() {
        let store = MemoryGallery::new();
        let err = store.replace_image(RecordId(42), None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(RecordId(42))));
    }
}
