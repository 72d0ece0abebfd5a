//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::sync::Arc;

use mlw_common::config::{MessagingConfig, ModelConfig};
use mlw_common::time::{format_timestamp, iso_timestamp, Clock};
use mlw_schema::{SchemaCatalog, SchemaId};
use serde_json::{json, Map, Value};

use crate::incoming::IncomingMessage;
use crate::kind::ResultKind;
use crate::table::{self, Table};
use crate::topic::render_topic;
use crate::{MessagingError, Result};

const TEXT_FIELDS: [&str; 2] = ["total", "predict"];

/// Value produced by an analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutput {
    /// One result table.
    Table(Table),
    /// Several result tables.
    Tables(Vec<Table>),
    /// Text result record.
    Record(Map<String, Value>),
}

impl AnalysisOutput {
    /// Result kind implied by the value's shape.
    pub fn infer_kind(&self) -> Result<ResultKind> {
        match self {
            AnalysisOutput::Table(_) => Ok(ResultKind::TimeSeries),
            AnalysisOutput::Tables(_) => Ok(ResultKind::MultipleTimeSeries),
            AnalysisOutput::Record(record)
                if TEXT_FIELDS.iter().all(|field| record.contains_key(*field)) =>
            {
                Ok(ResultKind::Text)
            }
            AnalysisOutput::Record(_) => Err(MessagingError::InvalidResult(
                "the given results are not parsable, set the result kind explicitly".into(),
            )),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            AnalysisOutput::Table(_) => "a table",
            AnalysisOutput::Tables(_) => "a list of tables",
            AnalysisOutput::Record(_) => "a record",
        }
    }
}

impl From<Table> for AnalysisOutput {
    fn from(table: Table) -> Self {
        AnalysisOutput::Table(table)
    }
}

impl From<Vec<Table>> for AnalysisOutput {
    fn from(tables: Vec<Table>) -> Self {
        AnalysisOutput::Tables(tables)
    }
}

impl From<Map<String, Value>> for AnalysisOutput {
    fn from(record: Map<String, Value>) -> Self {
        AnalysisOutput::Record(record)
    }
}

/// Where an outgoing message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Result topic root, e.g. `kosmos/analyses/`.
    pub base_topic: String,
    /// Route to the temporary sub topic.
    pub temporary: bool,
    /// Suffix used for temporary results.
    pub temporary_keyword: String,
}

impl Routing {
    /// Routing derived from the messaging configuration.
    pub fn from_config(config: &MessagingConfig, temporary: bool) -> Self {
        Self {
            base_topic: config.base_result_topic.clone(),
            temporary,
            temporary_keyword: config.temporary_keyword.clone(),
        }
    }
}

/// Analysis result answering one incoming message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    incoming: IncomingMessage,
    model: ModelConfig,
    routing: Routing,
    catalog: Arc<SchemaCatalog>,
    clock: Arc<dyn Clock>,
    body: Option<Value>,
}

impl OutgoingMessage {
    /// Bind a new, still empty result to its causal incoming message.
    pub fn new(
        incoming: IncomingMessage,
        model: ModelConfig,
        routing: Routing,
        catalog: Arc<SchemaCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            incoming,
            model,
            routing,
            catalog,
            clock,
            body: None,
        }
    }

    /// The message this result answers.
    pub fn incoming(&self) -> &IncomingMessage {
        &self.incoming
    }

    /// Mutable access to the causal message, e.g. for its custom information.
    pub fn incoming_mut(&mut self) -> &mut IncomingMessage {
        &mut self.incoming
    }

    /// Identity the result is published under.
    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Whether the result goes to the temporary sub topic.
    pub fn is_temporary(&self) -> bool {
        self.routing.temporary
    }

    /// `{base}/{contract}[/{temporary keyword}]`.
    pub fn topic(&self) -> Result<String> {
        let contract = self.incoming.contract().ok_or_else(|| {
            MessagingError::NotInitialized("the incoming message carries no contract".into())
        })?;
        Ok(render_topic(
            &self.routing.base_topic,
            contract,
            self.routing.temporary,
            &self.routing.temporary_keyword,
        ))
    }

    /// Turn an analysis value into the result body.
    ///
    /// Without an explicit `kind` the kind is inferred from the value's
    /// shape. The body only changes when the assembled result is schema
    /// conform.
    pub fn set_results(&mut self, output: AnalysisOutput, kind: Option<ResultKind>) -> Result<()> {
        let kind = match kind {
            Some(kind) => kind,
            None => output.infer_kind()?,
        };
        let results = match (kind, output) {
            (ResultKind::TimeSeries, AnalysisOutput::Table(table)) => table::encode(&table),
            (ResultKind::MultipleTimeSeries, AnalysisOutput::Tables(tables)) => {
                Value::Array(tables.iter().map(table::encode).collect())
            }
            (ResultKind::Text, AnalysisOutput::Record(record)) => {
                check_text_record(&record)?;
                Value::Object(record)
            }
            (kind, output) => {
                return Err(MessagingError::InvalidResult(format!(
                    "a {} result cannot be built from {}",
                    kind,
                    output.shape()
                )))
            }
        };
        let body = self.assemble(kind, results)?;
        self.set_body(body)
    }

    /// Replace the body after validating it as analysis result.
    pub fn set_body(&mut self, body: Value) -> Result<()> {
        let payload = payload_document(&body);
        self.catalog.validate(&payload, SchemaId::AnalysisResult)?;
        self.body = Some(body);
        Ok(())
    }

    /// Parse and set a JSON encoded body.
    pub fn set_body_str(&mut self, body: &str) -> Result<()> {
        let body: Value = serde_json::from_str(body)?;
        self.set_body(body)
    }

    /// The result body.
    pub fn body(&self) -> Result<&Value> {
        self.body.as_ref().ok_or_else(|| {
            MessagingError::NotInitialized(
                "the body has not been set, use set_results or set_body".into(),
            )
        })
    }

    /// Whether a body was set.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Result kind recorded in the body.
    pub fn result_kind(&self) -> Option<ResultKind> {
        self.body
            .as_ref()
            .and_then(|body| body.get("type"))
            .and_then(Value::as_str)
            .and_then(ResultKind::lookup)
    }

    /// `{"body": .., "signature": ..}` document.
    pub fn payload_value(&self) -> Result<Value> {
        Ok(payload_document(self.body()?))
    }

    /// Serialized payload as published.
    pub fn payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload_value()?)?)
    }

    fn assemble(&self, kind: ResultKind, results: Value) -> Result<Value> {
        self.incoming.check_initialized()?;
        Ok(json!({
            "type": kind.as_str(),
            "from": self.model.from,
            "model": {"url": self.model.url, "tag": self.model.tag},
            "calculated": {
                "message": {
                    "machine": self.incoming.machine().unwrap_or_default(),
                    "sensor": self.incoming.sensor().unwrap_or_default()
                },
                "received": format_timestamp(self.incoming.received())
            },
            "results": results,
            "timestamp": iso_timestamp(self.clock.as_ref())
        }))
    }
}

fn payload_document(body: &Value) -> Value {
    json!({"body": body, "signature": sign_body(body)})
}

// TODO: sign bodies once tools are provisioned with signing keys.
fn sign_body(_body: &Value) -> String {
    String::new()
}

/// A text result needs `total` and `predict`.
pub(crate) fn check_text_record(record: &Map<String, Value>) -> Result<()> {
    match TEXT_FIELDS
        .into_iter()
        .find(|field| !record.contains_key(*field))
    {
        Some(missing) => Err(MessagingError::MissingField(missing)),
        None => Ok(()),
    }
}
