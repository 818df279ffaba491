//! JSON bodies returned over D-Bus.

use reunite_core::{MatchResult, MissingPersonRecord};
use serde::Serialize;
use serde_json::{json, Value};

use crate::engine::EngineStatus;

pub const NO_MATCH_MESSAGE: &str = "No match found.";

pub fn registered(record: &MissingPersonRecord) -> Value {
    json!({ "id": record.id })
}

pub fn matched(result: &MatchResult) -> Value {
    json!({
        "match": result.record.payload(),
        "distance": result.distance,
    })
}

pub fn no_match() -> Value {
    json!({ "match": null, "message": NO_MATCH_MESSAGE })
}

/// `{"error": {"kind": ..., "message": ...}}`. `kind` is any value that
/// serializes to a string.
pub fn error(kind: impl Serialize, message: impl std::fmt::Display) -> Value {
    json!({ "error": { "kind": kind, "message": message.to_string() } })
}

/// Record view for `GetRecord`. The descriptor itself is not exposed.
pub fn record(record: &MissingPersonRecord) -> Value {
    let payload = record.payload();
    json!({
        "id": record.id,
        "full_name": payload.name,
        "contact_info": payload.contact_info,
        "reporter_address": payload.reporter_address,
        "missing_place_address": payload.missing_place_address,
        "identity_details": payload.identity_details,
        "image_url": payload.image_url,
        "has_descriptor": record.descriptor.as_ref().is_some_and(|c| c.descriptor.is_some()),
        "created_at": record.created_at,
    })
}

pub fn status(status: &EngineStatus) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "records": status.records,
        "threshold": status.threshold,
        "policy": status.policy,
        "metric": status.metric,
        "model_id": status.model_id,
        "cache": status.cache,
    })
}
