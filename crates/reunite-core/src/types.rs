use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::DecodeError;

/// Gallery-assigned record identity. Ascending ids are the scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Face descriptor vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn with_model(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self { values, model_version: Some(model_version.into()) }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Descriptors are comparable when they share a dimension and, where both
    /// declare one, a model version.
    pub fn is_compatible(&self, other: &Descriptor) -> bool {
        if self.dim() != other.dim() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Location and content digest of a stored reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Store-relative location, e.g. `missing_person_images/<digest>.jpg`.
    pub location: String,
    /// Lowercase hex SHA-256 of the image bytes.
    pub digest: String,
}

/// Image bytes that passed format sniffing, ready to be stored.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
    pub digest: String,
}

impl ImageUpload {
    /// Sniff the image format from its magic bytes and compute the digest.
    ///
    /// Only the header is inspected; a truncated body still passes here and is
    /// caught at extraction time.
    pub fn new(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        let format = image::guess_format(&bytes).map_err(|e| DecodeError(e.to_string()))?;
        let extension = format.extensions_str().first().copied().unwrap_or("img");
        let digest = sha256_hex(&bytes);
        Ok(Self { bytes, extension, digest })
    }

    /// Store-relative path the upload is filed under.
    pub fn location(&self) -> String {
        format!("{IMAGE_DIR}/{}.{}", self.digest, self.extension)
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef { location: self.location(), digest: self.digest.clone() }
    }
}

/// Directory (relative to the media root) that reference images live in.
pub const IMAGE_DIR: &str = "missing_person_images";

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Memoized extraction result for one reference image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDescriptor {
    /// Extractor that produced the entry.
    pub model_id: String,
    /// Digest of the image the entry was computed from.
    pub source_digest: String,
    /// `None` when the image decoded to no usable face.
    pub descriptor: Option<Descriptor>,
}

/// A registered missing person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingPersonRecord {
    pub id: RecordId,
    pub full_name: String,
    pub contact_info: String,
    pub reporter_address: String,
    pub missing_place_address: String,
    pub identity_details: String,
    pub reference_image: Option<ImageRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<CachedDescriptor>,
    pub created_at: DateTime<Utc>,
}

impl MissingPersonRecord {
    /// The cached entry, if it belongs to the current image and the given model.
    pub fn cached_descriptor(&self, model_id: &str) -> Option<&CachedDescriptor> {
        let image = self.reference_image.as_ref()?;
        self.descriptor
            .as_ref()
            .filter(|c| c.source_digest == image.digest && c.model_id == model_id)
    }

    pub fn payload(&self) -> MatchPayload {
        MatchPayload {
            name: self.full_name.clone(),
            contact_info: self.contact_info.clone(),
            reporter_address: self.reporter_address.clone(),
            missing_place_address: self.missing_place_address.clone(),
            identity_details: self.identity_details.clone(),
            image_url: self.reference_image.as_ref().map(|i| i.location.clone()),
        }
    }
}

/// Validated fields for a record that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub full_name: String,
    pub contact_info: String,
    pub reporter_address: String,
    pub missing_place_address: String,
    pub identity_details: String,
    pub reference_image: Option<ImageUpload>,
}

/// What a presentation layer needs to show a matched person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPayload {
    pub name: String,
    pub contact_info: String,
    pub reporter_address: String,
    pub missing_place_address: String,
    pub identity_details: String,
    pub image_url: Option<String>,
}
