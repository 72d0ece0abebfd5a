//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Inbound trigger message and its extraction stages.
//!
//! A message starts [`Stage::Empty`], becomes [`Stage::Initialized`] once
//! both topic and payload were accepted and [`Stage::Retrieved`] once the
//! nested payload was decoded into [`RetrievedData`]. Transitions consume
//! the message and hand back the advanced one.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use mlw_common::time::Clock;
use mlw_schema::{SchemaCatalog, SchemaId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::classify::classify;
use crate::kind::{EnvelopeKind, ResultKind};
use crate::outgoing::check_text_record;
use crate::table::{self, Table};
use crate::topic::{parse_topic, TriggerTopic};
use crate::{MessagingError, Result};

/// Extraction stage of an [`IncomingMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Topic or payload still missing.
    Empty,
    /// Topic and payload accepted.
    Initialized,
    /// Typed data extracted.
    Retrieved,
}

/// Routing fields of an accepted trigger envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Classified envelope kind.
    pub kind: EnvelopeKind,
    /// Machine the data belongs to.
    pub machine: String,
    /// Sensor the data belongs to.
    pub sensor: String,
    /// Routing key for the answer.
    pub contract: String,
    /// Nested kind specific payload.
    pub payload: Value,
    /// Envelope timestamp, if any.
    pub timestamp: Option<String>,
}

/// Per column metadata of a sensor update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Physical unit.
    pub unit: Option<String>,
    /// Human readable description.
    pub description: Option<String>,
    /// Whether the column holds forecast values.
    pub future: bool,
}

/// Typed content of a retrieved message.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievedData {
    /// Sensor data with optional metadata.
    SensorUpdate {
        /// Decoded sensor table.
        table: Table,
        /// Free form `meta` block.
        metadata: Option<Value>,
        /// Column metadata keyed by column name.
        column_meta: IndexMap<String, ColumnMeta>,
    },
    /// One result table.
    TimeSeries(Table),
    /// Ordered result tables.
    MultipleTimeSeries(Vec<Table>),
    /// Text result record.
    Text(Map<String, Value>),
}

impl RetrievedData {
    /// Result kind of a previous analysis, `None` for sensor updates.
    pub fn result_kind(&self) -> Option<ResultKind> {
        match self {
            RetrievedData::SensorUpdate { .. } => None,
            RetrievedData::TimeSeries(_) => Some(ResultKind::TimeSeries),
            RetrievedData::MultipleTimeSeries(_) => Some(ResultKind::MultipleTimeSeries),
            RetrievedData::Text(_) => Some(ResultKind::Text),
        }
    }

    /// All tables carried by the message.
    pub fn tables(&self) -> Vec<&Table> {
        match self {
            RetrievedData::SensorUpdate { table, .. } | RetrievedData::TimeSeries(table) => {
                vec![table]
            }
            RetrievedData::MultipleTimeSeries(tables) => tables.iter().collect(),
            RetrievedData::Text(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Retrieved {
    data: RetrievedData,
    timestamp: Option<String>,
}

/// Trigger message received from the bus.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    id: Uuid,
    received: DateTime<Utc>,
    topic: Option<(String, TriggerTopic)>,
    envelope: Option<Envelope>,
    retrieved: Option<Retrieved>,
    /// Slot a handler may fill before the analysis runs.
    pub custom_information: Option<Value>,
}

impl IncomingMessage {
    /// Empty message stamped with the clock's current time.
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            id: Uuid::new_v4(),
            received: clock.now(),
            topic: None,
            envelope: None,
            retrieved: None,
            custom_information: None,
        }
    }

    /// Accept, classify and extract a bus message in one go.
    pub fn from_wire(
        topic: &str,
        payload: &str,
        catalog: &SchemaCatalog,
        clock: &dyn Clock,
    ) -> Result<Self> {
        Self::new(clock)
            .with_topic(topic)?
            .with_payload(payload, catalog)?
            .retrieve(catalog)
    }

    /// Accept the trigger topic.
    pub fn with_topic(mut self, topic: &str) -> Result<Self> {
        let parsed = parse_topic(topic)?;
        self.topic = Some((topic.to_owned(), parsed));
        Ok(self)
    }

    /// Accept and classify the raw payload. Previously retrieved data is
    /// discarded.
    pub fn with_payload(mut self, payload: &str, catalog: &SchemaCatalog) -> Result<Self> {
        let classified = classify(payload, catalog)?;
        let body = &classified.envelope["body"];
        let field = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        self.envelope = Some(Envelope {
            kind: classified.kind,
            machine: field("machine"),
            sensor: field("sensor"),
            contract: field("contract"),
            payload: body.get("payload").cloned().unwrap_or(Value::Null),
            timestamp: body
                .get("timestamp")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        });
        self.retrieved = None;
        Ok(self)
    }

    /// Extract the typed data of the nested payload.
    ///
    /// Kind specific checks run before the nested payload is validated
    /// against its schema, so missing sections surface as `EmptyResult`
    /// and unknown types as `InvalidType`.
    pub fn retrieve(mut self, catalog: &SchemaCatalog) -> Result<Self> {
        self.check_initialized()?;
        let envelope = self
            .envelope
            .as_ref()
            .ok_or_else(|| MessagingError::NotInitialized("payload missing".into()))?;
        let body = envelope
            .payload
            .get("body")
            .filter(|body| body.is_object())
            .ok_or(MessagingError::MissingKey("body"))?;
        let (data, schema) = match envelope.kind {
            EnvelopeKind::SensorUpdate => (extract_sensor_update(body)?, SchemaId::SensorUpdate),
            EnvelopeKind::AnalysisResult => (extract_analysis(body)?, SchemaId::AnalysisResult),
        };
        catalog.validate(&envelope.payload, schema)?;
        let timestamp = body
            .get("timestamp")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .or_else(|| envelope.timestamp.clone());
        debug!(message_id = %self.id, kind = %envelope.kind, "message retrieved");
        self.retrieved = Some(Retrieved { data, timestamp });
        Ok(self)
    }

    /// Current extraction stage.
    pub fn stage(&self) -> Stage {
        if self.retrieved.is_some() {
            Stage::Retrieved
        } else if self.is_initialized() {
            Stage::Initialized
        } else {
            Stage::Empty
        }
    }

    /// Whether both topic and payload were accepted.
    pub fn is_initialized(&self) -> bool {
        self.topic.is_some() && self.envelope.is_some()
    }

    /// Fail with `NotInitialized` unless topic and payload were accepted.
    pub fn check_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let mut missing = Vec::new();
        if self.topic.is_none() {
            missing.push("topic");
        }
        if self.envelope.is_none() {
            missing.push("payload");
        }
        Err(MessagingError::NotInitialized(format!(
            "incoming message lacks {}",
            missing.join(" and ")
        )))
    }

    /// Whether typed data was extracted.
    pub fn is_retrieved(&self) -> bool {
        self.retrieved.is_some()
    }

    /// Fail with `NotYetRetrieved` unless typed data was extracted.
    pub fn check_retrieved(&self) -> Result<()> {
        if self.is_retrieved() {
            Ok(())
        } else {
            Err(MessagingError::NotYetRetrieved {
                missing: vec!["data", "columns", "timestamp"],
            })
        }
    }

    /// Message identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Time the message object was created.
    pub fn received(&self) -> DateTime<Utc> {
        self.received
    }

    /// Raw trigger topic.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_ref().map(|(raw, _)| raw.as_str())
    }

    /// Model url parsed from the topic.
    pub fn model(&self) -> Option<&str> {
        self.topic.as_ref().map(|(_, parsed)| parsed.model.as_str())
    }

    /// Model tag parsed from the topic.
    pub fn tag(&self) -> Option<&str> {
        self.topic.as_ref().map(|(_, parsed)| parsed.tag.as_str())
    }

    /// Accepted envelope.
    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    /// Envelope kind.
    pub fn kind(&self) -> Option<EnvelopeKind> {
        self.envelope.as_ref().map(|envelope| envelope.kind)
    }

    /// Machine routing field.
    pub fn machine(&self) -> Option<&str> {
        self.envelope.as_ref().map(|envelope| envelope.machine.as_str())
    }

    /// Sensor routing field.
    pub fn sensor(&self) -> Option<&str> {
        self.envelope.as_ref().map(|envelope| envelope.sensor.as_str())
    }

    /// Contract the answer is routed to.
    pub fn contract(&self) -> Option<&str> {
        self.envelope.as_ref().map(|envelope| envelope.contract.as_str())
    }

    /// Nested kind specific payload.
    pub fn payload(&self) -> Option<&Value> {
        self.envelope.as_ref().map(|envelope| &envelope.payload)
    }

    /// Retrieved typed data.
    pub fn data(&self) -> Result<&RetrievedData> {
        self.check_retrieved()?;
        self.retrieved
            .as_ref()
            .map(|retrieved| &retrieved.data)
            .ok_or(MessagingError::NotYetRetrieved {
                missing: vec!["data"],
            })
    }

    /// Timestamp of the nested payload, falling back to the envelope's.
    pub fn timestamp(&self) -> Option<&str> {
        self.retrieved
            .as_ref()
            .and_then(|retrieved| retrieved.timestamp.as_deref())
    }

    /// Result kind of a retrieved analysis result.
    pub fn result_kind(&self) -> Option<ResultKind> {
        self.retrieved
            .as_ref()
            .and_then(|retrieved| retrieved.data.result_kind())
    }
}

fn extract_sensor_update(body: &Value) -> Result<RetrievedData> {
    if body.get("data").map_or(true, Value::is_null) {
        return Err(MessagingError::EmptyResult(
            "a sensor update requires a 'data' section".into(),
        ));
    }
    let table = table::decode(body)?;
    Ok(RetrievedData::SensorUpdate {
        table,
        metadata: body.get("meta").filter(|meta| !meta.is_null()).cloned(),
        column_meta: column_meta(body),
    })
}

fn column_meta(body: &Value) -> IndexMap<String, ColumnMeta> {
    body.get("columns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .filter_map(|column| {
                    let name = column.get("name")?.as_str()?;
                    let text = |key: &str| {
                        column
                            .get(key)
                            .and_then(Value::as_str)
                            .map(ToOwned::to_owned)
                    };
                    Some((
                        name.to_owned(),
                        ColumnMeta {
                            unit: text("unit"),
                            description: text("description"),
                            future: column
                                .get("future")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_analysis(body: &Value) -> Result<RetrievedData> {
    let type_name = body.get("type").and_then(Value::as_str).unwrap_or_default();
    let kind = ResultKind::lookup(type_name).ok_or_else(|| {
        MessagingError::InvalidType(format!("result type '{}' is not known", type_name))
    })?;
    let results = body
        .get("results")
        .filter(|results| !results.is_null())
        .ok_or_else(|| {
            MessagingError::EmptyResult("the result of a message cannot be empty".into())
        })?;
    match kind {
        ResultKind::TimeSeries => table::decode(results).map(RetrievedData::TimeSeries),
        ResultKind::MultipleTimeSeries => results
            .as_array()
            .ok_or_else(|| {
                MessagingError::InvalidResult("multiple time series results must be a list".into())
            })?
            .iter()
            .map(table::decode)
            .collect::<Result<Vec<_>>>()
            .map(RetrievedData::MultipleTimeSeries),
        ResultKind::Text => {
            let record = results.as_object().ok_or_else(|| {
                MessagingError::InvalidResult("text results must be a record".into())
            })?;
            check_text_record(record)?;
            Ok(RetrievedData::Text(record.clone()))
        }
    }
}
