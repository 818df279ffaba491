//! reunite-models — Face descriptors from photos.
//!
//! SCRFD finds faces and their landmarks, each face is aligned to the
//! canonical ArcFace crop, and ArcFace turns the crop into a descriptor.
//! Both models run on CPU through ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod face;
pub mod recognizer;

use image::RgbImage;
use reunite_core::{DecodeError, Descriptor, DescriptorExtractor, DistanceMetric, ExtractError};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub use detector::{DetectorError, FaceDetector};
pub use face::FaceBox;
pub use recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const DEFAULT_MAX_FACES: usize = 4;

/// Lowest cosine similarity at which two ArcFace descriptors are taken to
/// be the same person.
pub const ARCFACE_MIN_SIMILARITY: f32 = 0.40;

/// Match threshold calibrated for [`OnnxExtractor`] descriptors.
///
/// Descriptors are unit length, so a Euclidean distance `d` corresponds to a
/// cosine similarity of `1 - d²/2`.
pub fn recommended_threshold(metric: DistanceMetric) -> f32 {
    let max_cosine_distance = 1.0 - ARCFACE_MIN_SIMILARITY;
    match metric {
        DistanceMetric::Euclidean => (2.0 * max_cosine_distance).sqrt(),
        DistanceMetric::Cosine => max_cosine_distance,
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

/// [`DescriptorExtractor`] backed by SCRFD + ArcFace.
///
/// Sessions need exclusive access to run, so each sits behind its own mutex;
/// detection of one image can overlap recognition of another.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    max_faces: usize,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            max_faces: DEFAULT_MAX_FACES,
        })
    }

    /// Cap on faces described per image. Extra detections (lowest
    /// confidence) are dropped.
    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = max_faces.max(1);
        self
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn model_id(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn extract(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractError> {
        let rgb = decode(image)?;

        let faces = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&rgb)
            .map_err(|e| ExtractError::Failed(e.to_string()))?;
        tracing::debug!(
            faces = faces.len(),
            width = rgb.width(),
            height = rgb.height(),
            "faces detected"
        );

        let mut recognizer = self.recognizer.lock().unwrap_or_else(PoisonError::into_inner);
        faces
            .iter()
            .take(self.max_faces)
            .map(|face| {
                recognizer
                    .describe(&rgb, face)
                    .map_err(|e| ExtractError::Failed(e.to_string()))
            })
            .collect()
    }
}

fn decode(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| DecodeError(e.to_string()))
}
