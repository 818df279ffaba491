use reunite_core::{RecordId, RegisterError, RegistrationForm, StoreError};
use zbus::{fdo, interface};

use crate::engine::{EngineError, EngineHandle};
use crate::response;

/// D-Bus interface for the Reunite gallery daemon.
///
/// Bus name: org.reunite.Gallery1
/// Object path: /org/reunite/Gallery1
///
/// Caller mistakes come back as JSON `{"error": ...}` bodies; daemon faults
/// are D-Bus errors.
pub struct GalleryService {
    engine: EngineHandle,
}

impl GalleryService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.reunite.Gallery1")]
impl GalleryService {
    /// Register a missing-person report. An empty `image` means no photo.
    async fn register(
        &self,
        full_name: String,
        contact_info: String,
        reporter_address: String,
        missing_place_address: String,
        identity_details: String,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        tracing::info!(image_bytes = image.len(), "register requested");
        let form = RegistrationForm {
            full_name,
            contact_info,
            reporter_address,
            missing_place_address,
            identity_details,
            reference_image: Some(image),
        };
        let body = match self.engine.register(form).await {
            Ok(record) => response::registered(&record),
            Err(err) => rejected(err)?,
        };
        Ok(body.to_string())
    }

    /// Search the gallery for the person in `image`.
    async fn match_image(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(image_bytes = image.len(), "match requested");
        let body = match self.engine.match_image(image).await {
            Ok(Some(found)) => response::matched(&found),
            Ok(None) => response::no_match(),
            Err(err) => rejected(err)?,
        };
        Ok(body.to_string())
    }

    async fn get_record(&self, id: u64) -> fdo::Result<String> {
        let id = RecordId(id);
        let body = match self.engine.get(id).await.map_err(internal)? {
            Some(record) => response::record(&record),
            None => response::error("not_found", format!("record {id} not found")),
        };
        Ok(body.to_string())
    }

    /// Replace the reference photo. An empty `image` removes it.
    async fn replace_image(&self, id: u64, image: Vec<u8>) -> fdo::Result<String> {
        let id = RecordId(id);
        tracing::info!(%id, image_bytes = image.len(), "replace_image requested");
        let body = match self.engine.replace_image(id, Some(image)).await {
            Ok(record) => response::record(&record),
            Err(err) => rejected(err)?,
        };
        Ok(body.to_string())
    }

    async fn remove_record(&self, id: u64) -> fdo::Result<bool> {
        let id = RecordId(id);
        tracing::info!(%id, "remove_record requested");
        self.engine.remove(id).await.map_err(internal)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(internal)?;
        Ok(response::status(&status).to_string())
    }
}

/// JSON body for an error the caller can act on, or a D-Bus error for a
/// daemon fault.
fn rejected(err: EngineError) -> fdo::Result<serde_json::Value> {
    match err {
        EngineError::Register(RegisterError::Validation(e)) => Ok(response::error("validation", e)),
        EngineError::Register(RegisterError::Decode(e)) => Ok(response::error("validation", e)),
        EngineError::Register(RegisterError::Store(StoreError::NotFound(id))) => {
            Ok(response::error("not_found", format!("record {id} not found")))
        }
        EngineError::Query(e) => Ok(response::error(e.kind(), e)),
        other => Err(internal(other)),
    }
}

fn internal(err: EngineError) -> fdo::Error {
    tracing::error!(error = %err, "request failed");
    fdo::Error::Failed(err.to_string())
}
