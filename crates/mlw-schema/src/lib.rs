//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Payload schema catalog and validation logic."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Schema catalog for the ML wrapper messaging layer.
//!
//! The three payload schemas (trigger envelope, sensor update, analysis
//! result) are embedded at compile time. File references between them are
//! rewritten to absolute URIs and every document is registered with the
//! validator's in-memory store, so validation never touches the filesystem.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::debug;

/// Base URI shared by all embedded schema documents.
pub const SCHEMA_BASE_URI: &str = "https://schemas.kosmos.invalid/mqtt-payloads/";

const TRIGGER_SCHEMA: &str = include_str!("../schemas/trigger.json");
const DATA_SCHEMA: &str = include_str!("../schemas/data.json");
const ANALYSIS_SCHEMA: &str = include_str!("../schemas/analysis.json");

static SHARED: OnceCell<Arc<SchemaCatalog>> = OnceCell::new();

/// Shared result type for schema routines.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised by the schema catalog.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// An embedded document is not valid JSON.
    #[error("embedded schema {schema} is not valid json: {source}")]
    Embedded {
        schema: SchemaId,
        #[source]
        source: serde_json::Error,
    },
    /// An embedded document could not be compiled into a validator.
    #[error("schema {schema} failed to compile: {reason}")]
    Compile { schema: SchemaId, reason: String },
    /// A document does not conform to the requested schema.
    #[error("payload does not conform to {schema}: {}", .messages.join("; "))]
    Violation {
        schema: SchemaId,
        messages: Vec<String>,
    },
}

/// Identifier of an embedded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaId {
    /// Outer trigger envelope published on analytics topics.
    Trigger,
    /// Sensor update payload carrying one table.
    SensorUpdate,
    /// Analysis result payload published by a tool.
    AnalysisResult,
}

impl SchemaId {
    pub const ALL: [SchemaId; 3] = [
        SchemaId::Trigger,
        SchemaId::SensorUpdate,
        SchemaId::AnalysisResult,
    ];

    /// File name of the embedded document.
    pub fn file_name(self) -> &'static str {
        match self {
            SchemaId::Trigger => "trigger.json",
            SchemaId::SensorUpdate => "data.json",
            SchemaId::AnalysisResult => "analysis.json",
        }
    }

    /// Absolute URI the document is registered under.
    pub fn uri(self) -> String {
        format!("{}{}", SCHEMA_BASE_URI, self.file_name())
    }

    fn source(self) -> &'static str {
        match self {
            SchemaId::Trigger => TRIGGER_SCHEMA,
            SchemaId::SensorUpdate => DATA_SCHEMA,
            SchemaId::AnalysisResult => ANALYSIS_SCHEMA,
        }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Compiled set of payload schemas.
pub struct SchemaCatalog {
    documents: HashMap<SchemaId, Value>,
    compiled: HashMap<SchemaId, JSONSchema>,
}

impl fmt::Debug for SchemaCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaCatalog")
            .field("schemas", &self.documents.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaCatalog {
    /// Parse, rewrite and compile all embedded schemas.
    pub fn load() -> SchemaResult<Self> {
        let mut documents = HashMap::with_capacity(SchemaId::ALL.len());
        for id in SchemaId::ALL {
            let mut document: Value = serde_json::from_str(id.source())
                .map_err(|source| SchemaError::Embedded { schema: id, source })?;
            absolutize(&mut document, &id.uri());
            documents.insert(id, document);
        }

        let mut compiled = HashMap::with_capacity(documents.len());
        for id in SchemaId::ALL {
            let mut options = JSONSchema::options();
            options.with_draft(Draft::Draft7);
            for (other, document) in &documents {
                options.with_document(other.uri(), document.clone());
            }
            let root = &documents[&id];
            let schema = options
                .compile(root)
                .map_err(|err| SchemaError::Compile {
                    schema: id,
                    reason: err.to_string(),
                })?;
            compiled.insert(id, schema);
        }
        debug!(schemas = compiled.len(), "schema catalog compiled");
        Ok(Self {
            documents,
            compiled,
        })
    }

    /// Process-wide catalog, compiled on first use.
    pub fn shared() -> SchemaResult<Arc<SchemaCatalog>> {
        SHARED
            .get_or_try_init(|| Self::load().map(Arc::new))
            .map(Arc::clone)
    }

    /// The rewritten schema document for `id`.
    pub fn resolve(&self, id: SchemaId) -> &Value {
        &self.documents[&id]
    }

    /// Validate `document` against schema `id`, collecting every violation.
    pub fn validate(&self, document: &Value, id: SchemaId) -> SchemaResult<()> {
        let schema = &self.compiled[&id];
        schema.validate(document).map_err(|errors| {
            let messages = errors
                .map(|err| {
                    let path = err.instance_path.to_string();
                    if path.is_empty() {
                        err.to_string()
                    } else {
                        format!("{} (at {})", err, path)
                    }
                })
                .collect();
            SchemaError::Violation {
                schema: id,
                messages,
            }
        })
    }

    /// Shortcut for a pass/fail answer.
    pub fn is_valid(&self, document: &Value, id: SchemaId) -> bool {
        self.compiled[&id].is_valid(document)
    }
}

/// Rewrite `$id` and every `$ref` of a document to absolute URIs.
fn absolutize(document: &mut Value, own_uri: &str) {
    if let Value::Object(map) = document {
        map.insert("$id".to_owned(), Value::String(own_uri.to_owned()));
    }
    rewrite_refs(document, own_uri);
}

fn rewrite_refs(node: &mut Value, own_uri: &str) {
    match node {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Value::String(reference) if key == "$ref" => {
                        *reference = absolute_ref(reference, own_uri);
                    }
                    _ => rewrite_refs(value, own_uri),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_refs(item, own_uri);
            }
        }
        _ => {}
    }
}

fn absolute_ref(reference: &str, own_uri: &str) -> String {
    if reference.starts_with('#') {
        format!("{}{}", own_uri, reference)
    } else if reference.contains("://") {
        reference.to_owned()
    } else {
        format!("{}{}", SCHEMA_BASE_URI, reference)
    }
}
