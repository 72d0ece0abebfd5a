//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives for analytics tools.
//!
//! Raw bus payloads are classified into an envelope kind, extracted into
//! typed tables or records, and answered with schema-conform analysis
//! results. The transport is abstracted behind [`Transport`].

pub mod classify;
pub mod incoming;
pub mod kind;
pub mod logging;
pub mod outgoing;
pub mod table;
pub mod topic;
pub mod transport;

use mlw_schema::SchemaError;

use crate::table::SemanticType;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures raised while classifying, extracting or assembling messages.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A message was used before topic and payload were both accepted, or
    /// an outgoing body was read before it was set.
    #[error("message not initialized: {0}")]
    NotInitialized(String),
    /// Typed data was requested before retrieval completed.
    #[error("the fields {missing:?} are not retrieved yet")]
    NotYetRetrieved {
        /// Fields that are still unset.
        missing: Vec<&'static str>,
    },
    /// A column type or result kind is not known.
    #[error("invalid type: {0}")]
    InvalidType(String),
    /// A section required by the message kind is absent.
    #[error("empty result: {0}")]
    EmptyResult(String),
    /// A topic does not follow the trigger topic convention.
    #[error("topic '{0}' does not conform to kosmos/analytics/<model url>/<model tag>")]
    InvalidTopic(String),
    /// A payload failed envelope lookup or schema validation.
    #[error("payload is not schema conform: {0}")]
    NonSchemaConformJsonPayload(String),
    /// The message kind is excluded by the tool's reaction policy.
    #[error("wrong message type: {0}")]
    WrongMessageType(String),
    /// The payload is not valid JSON.
    #[error("payload is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    /// A key required before schema validation is absent.
    #[error("the '{0}' key is required in the payload")]
    MissingKey(&'static str),
    /// A result value cannot be turned into the requested result kind.
    #[error("invalid result: {0}")]
    InvalidResult(String),
    /// A text result lacks one of its mandatory fields.
    #[error("text results require the field '{0}'")]
    MissingField(&'static str),
    /// A cell cannot be parsed as its column's declared type.
    #[error("column '{column}': cannot read {value} as {expected}")]
    InvalidCell {
        /// Column holding the cell.
        column: String,
        /// Rendered cell value.
        value: String,
        /// Declared semantic type of the column.
        expected: SemanticType,
    },
    /// The schema catalog itself could not be loaded.
    #[error("schema catalog unavailable: {0}")]
    SchemaUnavailable(String),
    /// The transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),
}

impl MessagingError {
    /// Stable taxonomy name used when logging contained failures.
    pub fn name(&self) -> &'static str {
        match self {
            MessagingError::NotInitialized(_) => "NotInitialized",
            MessagingError::NotYetRetrieved { .. } => "NotYetRetrieved",
            MessagingError::InvalidType(_) => "InvalidType",
            MessagingError::EmptyResult(_) => "EmptyResult",
            MessagingError::InvalidTopic(_) => "InvalidTopic",
            MessagingError::NonSchemaConformJsonPayload(_) => "NonSchemaConformJsonPayload",
            MessagingError::WrongMessageType(_) => "WrongMessageType",
            MessagingError::Decode(_) => "JSONDecodeError",
            MessagingError::MissingKey(_) => "KeyError",
            MessagingError::InvalidResult(_) => "ValueError",
            MessagingError::MissingField(_) => "MissingField",
            MessagingError::InvalidCell { .. } => "InvalidCell",
            MessagingError::SchemaUnavailable(_) => "SchemaUnavailable",
            MessagingError::Transport(_) => "TransportError",
        }
    }
}

impl From<SchemaError> for MessagingError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Violation { .. } => {
                MessagingError::NonSchemaConformJsonPayload(err.to_string())
            }
            other => MessagingError::SchemaUnavailable(other.to_string()),
        }
    }
}

pub use classify::{classify, Classified};
pub use incoming::{ColumnMeta, Envelope, IncomingMessage, RetrievedData, Stage};
pub use kind::{EnvelopeKind, ResultKind};
pub use logging::{log_message, MessageDirection, WrapperMetrics};
pub use outgoing::{AnalysisOutput, OutgoingMessage, Routing};
pub use table::{Column, ColumnValues, Table};
pub use topic::{is_result_topic, parse_topic, render_topic, TriggerTopic};
pub use transport::{
    InMemoryTransport, InboundMessage, MessageCallback, PublishedMessage, Transport,
};
