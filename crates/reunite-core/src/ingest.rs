//! Registration of new missing-person reports.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::error::{DecodeError, StoreError};
use crate::store::GalleryStore;
use crate::types::{ImageUpload, MissingPersonRecord, NewRecord, RecordId};

/// Upper bound on an uploaded reference image.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),
    #[error("image is {size} bytes, limit is {limit}")]
    ImageTooLarge { size: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A report as submitted, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationForm {
    pub full_name: String,
    pub contact_info: String,
    pub reporter_address: String,
    pub missing_place_address: String,
    pub identity_details: String,
    /// Raw photo bytes. An empty buffer means no photo was attached.
    #[serde(skip)]
    pub reference_image: Option<Vec<u8>>,
}

impl RegistrationForm {
    /// Check required fields in form order and sniff the photo, if any.
    pub fn validate(self, max_image_bytes: usize) -> Result<NewRecord, RegisterError> {
        let fields = [
            ("full_name", &self.full_name),
            ("contact_info", &self.contact_info),
            ("reporter_address", &self.reporter_address),
            ("missing_place_address", &self.missing_place_address),
            ("identity_details", &self.identity_details),
        ];
        if let Some((name, _)) = fields.into_iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ValidationError::MissingField(name).into());
        }

        let reference_image = validate_image(self.reference_image, max_image_bytes)?;

        Ok(NewRecord {
            full_name: self.full_name,
            contact_info: self.contact_info,
            reporter_address: self.reporter_address,
            missing_place_address: self.missing_place_address,
            identity_details: self.identity_details,
            reference_image,
        })
    }
}

fn validate_image(
    bytes: Option<Vec<u8>>,
    max_image_bytes: usize,
) -> Result<Option<ImageUpload>, RegisterError> {
    let Some(bytes) = bytes.filter(|b| !b.is_empty()) else {
        return Ok(None);
    };
    if bytes.len() > max_image_bytes {
        return Err(ValidationError::ImageTooLarge { size: bytes.len(), limit: max_image_bytes }.into());
    }
    Ok(Some(ImageUpload::new(bytes)?))
}

/// Validates and persists reports. Descriptors are not computed here; the
/// first scan that reaches a record fills its cache entry.
pub struct IngestionPipeline {
    store: Arc<dyn GalleryStore>,
    max_image_bytes: usize,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        Self { store, max_image_bytes: DEFAULT_MAX_IMAGE_BYTES }
    }

    pub fn with_max_image_bytes(mut self, limit: usize) -> Self {
        self.max_image_bytes = limit;
        self
    }

    pub fn register(&self, form: RegistrationForm) -> Result<MissingPersonRecord, RegisterError> {
        let record = form.validate(self.max_image_bytes)?;
        let stored = self.store.insert(record)?;
        tracing::info!(
            id = %stored.id,
            has_image = stored.reference_image.is_some(),
            "missing person registered"
        );
        Ok(stored)
    }

    /// Swap the reference photo, or remove it with `None` or an empty buffer.
    /// The cached descriptor is dropped either way.
    pub fn replace_image(
        &self,
        id: RecordId,
        image: Option<Vec<u8>>,
    ) -> Result<MissingPersonRecord, RegisterError> {
        let upload = validate_image(image, self.max_image_bytes)?;
        let updated = self.store.replace_image(id, upload)?;
        tracing::info!(%id, has_image = updated.reference_image.is_some(), "reference image replaced");
        Ok(updated)
    }

    pub fn get(&self, id: RecordId) -> Result<Option<MissingPersonRecord>, StoreError> {
        self.store.get(id)
    }

    pub fn remove(&self, id: RecordId) -> Result<bool, StoreError> {
        let removed = self.store.remove(id)?;
        if removed {
            tracing::info!(%id, "record removed");
        }
        Ok(removed)
    }
}
