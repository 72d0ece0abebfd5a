//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use mlw_schema::{SchemaCatalog, SchemaId};
use serde_json::Value;
use tracing::debug;

use crate::kind::EnvelopeKind;
use crate::{MessagingError, Result};

/// Raw payload narrowed to one envelope kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    /// Kind looked up from `body.type` and confirmed by the trigger schema.
    pub kind: EnvelopeKind,
    /// The parsed trigger envelope.
    pub envelope: Value,
}

/// Classify a raw trigger payload.
///
/// The `body.type` tag is only a lookup key: it must name a known envelope
/// kind, and the envelope must then validate against the trigger schema.
/// The nested `body.payload` is left for extraction.
pub fn classify(payload: &str, catalog: &SchemaCatalog) -> Result<Classified> {
    let envelope: Value = serde_json::from_str(payload)?;
    let body = envelope
        .get("body")
        .filter(|body| body.is_object())
        .ok_or_else(|| {
            MessagingError::NonSchemaConformJsonPayload(
                "the 'body' object is required in the payload".into(),
            )
        })?;
    let type_name = body.get("type").and_then(Value::as_str).ok_or_else(|| {
        MessagingError::NonSchemaConformJsonPayload(
            "the 'type' keyword is required in the payload body".into(),
        )
    })?;
    let kind = EnvelopeKind::lookup(type_name).ok_or_else(|| {
        MessagingError::NonSchemaConformJsonPayload(format!(
            "'{}' cannot be used as type at the root level, only {} are accepted",
            type_name,
            EnvelopeKind::ALL
                .iter()
                .map(|kind| format!("'{}'", kind))
                .collect::<Vec<_>>()
                .join(" and ")
        ))
    })?;
    catalog.validate(&envelope, SchemaId::Trigger)?;
    debug!(kind = %kind, "payload classified");
    Ok(Classified { kind, envelope })
}
