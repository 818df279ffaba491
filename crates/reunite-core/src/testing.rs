//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::DecodeError;
use crate::extractor::{DescriptorExtractor, ExtractError};
use crate::ingest::RegistrationForm;
use crate::types::{Descriptor, ImageUpload, NewRecord};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Bytes that sniff as PNG and are unique per tag.
pub(crate) fn png(tag: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

pub(crate) fn new_record(name: &str, image: Option<Vec<u8>>) -> NewRecord {
    NewRecord {
        full_name: name.to_string(),
        contact_info: "555-0100".into(),
        reporter_address: "12 Elm St".into(),
        missing_place_address: "Central Station".into(),
        identity_details: "scar on left hand".into(),
        reference_image: image.map(|b| ImageUpload::new(b).unwrap()),
    }
}

pub(crate) fn form(name: &str, image: Option<Vec<u8>>) -> RegistrationForm {
    RegistrationForm {
        full_name: name.to_string(),
        contact_info: "555-0100".into(),
        reporter_address: "12 Elm St".into(),
        missing_place_address: "Central Station".into(),
        identity_details: "scar on left hand".into(),
        reference_image: image,
    }
}

#[derive(Clone)]
enum Outcome {
    Faces(Vec<Descriptor>),
    Corrupt,
    Broken,
}

/// Extractor scripted per input: bytes it was never told about have no face.
pub(crate) struct FakeExtractor {
    model_id: String,
    outcomes: Mutex<HashMap<Vec<u8>, Outcome>>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub(crate) fn new() -> Self {
        Self::with_model("fake")
    }

    pub(crate) fn with_model(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            outcomes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn faces(&self, image: &[u8], faces: &[&[f32]]) {
        let descriptors = faces
            .iter()
            .map(|v| Descriptor::with_model(v.to_vec(), self.model_id.clone()))
            .collect();
        self.set(image, Outcome::Faces(descriptors));
    }

    pub(crate) fn corrupt(&self, image: &[u8]) {
        self.set(image, Outcome::Corrupt);
    }

    pub(crate) fn broken(&self, image: &[u8]) {
        self.set(image, Outcome::Broken);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, image: &[u8], outcome: Outcome) {
        self.outcomes.lock().unwrap().insert(image.to_vec(), outcome);
    }
}

impl DescriptorExtractor for FakeExtractor {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn extract(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().get(image).cloned();
        match outcome {
            Some(Outcome::Faces(faces)) => Ok(faces),
            Some(Outcome::Corrupt) => Err(DecodeError("bad image".into()).into()),
            Some(Outcome::Broken) => Err(ExtractError::Failed("model crashed".into())),
            None => Ok(Vec::new()),
        }
    }
}
