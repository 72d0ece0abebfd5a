//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Conversion between wire tables and typed columnar tables.
//!
//! A wire table is `{"columns": [{"name", "type"}, ..], "data": [[..], ..]}`
//! where `data[i]` holds the cells of `columns[i]`. Cells are written as
//! strings; the column `type` carries the semantic type.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{MessagingError, Result};

const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const PARSE_TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Semantic column type carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    /// Integer or floating point values.
    Number,
    /// Free text.
    String,
    /// Timestamps.
    Rfctime,
}

impl SemanticType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticType::Number => "number",
            SemanticType::String => "string",
            SemanticType::Rfctime => "rfctime",
        }
    }

    /// Look a wire name up.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "number" => Some(SemanticType::Number),
            "string" => Some(SemanticType::String),
            "rfctime" => Some(SemanticType::Rfctime),
            _ => None,
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed storage of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    /// Whole numbers.
    Integer(Vec<i64>),
    /// Floating point numbers.
    Number(Vec<f64>),
    /// Text cells.
    Text(Vec<String>),
    /// Naive UTC timestamps.
    Timestamp(Vec<NaiveDateTime>),
}

impl ColumnValues {
    /// Semantic type written for this column.
    pub fn semantic_type(&self) -> SemanticType {
        match self {
            ColumnValues::Integer(_) | ColumnValues::Number(_) => SemanticType::Number,
            ColumnValues::Text(_) => SemanticType::String,
            ColumnValues::Timestamp(_) => SemanticType::Rfctime,
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Integer(values) => values.len(),
            ColumnValues::Number(values) => values.len(),
            ColumnValues::Text(values) => values.len(),
            ColumnValues::Timestamp(values) => values.len(),
        }
    }

    /// Whether the column has no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells in their canonical textual form.
    pub fn render(&self) -> Vec<String> {
        match self {
            ColumnValues::Integer(values) => values.iter().map(i64::to_string).collect(),
            ColumnValues::Number(values) => values.iter().copied().map(render_float).collect(),
            ColumnValues::Text(values) => values.clone(),
            ColumnValues::Timestamp(values) => values
                .iter()
                .map(|ts| ts.format(WIRE_TIME_FORMAT).to_string())
                .collect(),
        }
    }
}

/// Named column of a [`Table`].
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Typed cells.
    pub values: ColumnValues,
}

impl Column {
    /// Create a column.
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Typed columnar table with equally long columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, rejecting columns of different lengths.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let rows = first.values.len();
            if let Some(odd) = columns.iter().find(|column| column.values.len() != rows) {
                return Err(MessagingError::InvalidResult(format!(
                    "column '{}' has {} rows, expected {}",
                    odd.name,
                    odd.values.len(),
                    rows
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Table without columns or rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |column| column.values.len())
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Decode a wire table into a typed table.
pub fn decode(wire: &Value) -> Result<Table> {
    let columns = wire
        .get("columns")
        .ok_or_else(|| MessagingError::EmptyResult("table has no 'columns' section".into()))?
        .as_array()
        .ok_or_else(|| MessagingError::InvalidResult("'columns' must be a list".into()))?;
    let data = wire
        .get("data")
        .ok_or_else(|| MessagingError::EmptyResult("table has no 'data' section".into()))?
        .as_array()
        .ok_or_else(|| MessagingError::InvalidResult("'data' must be a list".into()))?;
    if columns.len() != data.len() {
        return Err(MessagingError::InvalidResult(format!(
            "{} columns declared but {} data columns present",
            columns.len(),
            data.len()
        )));
    }

    let mut decoded = Vec::with_capacity(columns.len());
    for (descriptor, cells) in columns.iter().zip(data) {
        let (name, semantic) = column_descriptor(descriptor)?;
        let cells = cells.as_array().ok_or_else(|| {
            MessagingError::InvalidResult(format!("data of column '{}' must be a list", name))
        })?;
        decoded.push(Column::new(name, decode_cells(name, semantic, cells)?));
    }
    Table::new(decoded)
}

/// Encode a typed table into its wire form. A table without rows encodes
/// as `{"columns": [], "data": []}`.
pub fn encode(table: &Table) -> Value {
    if table.is_empty() {
        return json!({"columns": [], "data": []});
    }
    let columns: Vec<Value> = table
        .columns()
        .iter()
        .map(|column| json!({"name": column.name, "type": column.values.semantic_type()}))
        .collect();
    let data: Vec<Vec<String>> = table
        .columns()
        .iter()
        .map(|column| column.values.render())
        .collect();
    json!({"columns": columns, "data": data})
}

fn column_descriptor(descriptor: &Value) -> Result<(&str, SemanticType)> {
    let name = descriptor
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| MessagingError::InvalidResult("column without a name".into()))?;
    let type_name = descriptor.get("type").and_then(Value::as_str).unwrap_or("");
    let semantic = SemanticType::from_name(type_name).ok_or_else(|| {
        MessagingError::InvalidType(format!(
            "column '{}' has unknown type '{}'",
            name, type_name
        ))
    })?;
    Ok((name, semantic))
}

fn decode_cells(name: &str, semantic: SemanticType, cells: &[Value]) -> Result<ColumnValues> {
    let invalid = |cell: &Value| MessagingError::InvalidCell {
        column: name.to_owned(),
        value: cell.to_string(),
        expected: semantic,
    };
    match semantic {
        SemanticType::Number => cells
            .iter()
            .map(|cell| parse_number(cell).ok_or_else(|| invalid(cell)))
            .collect::<Result<Vec<_>>>()
            .map(ColumnValues::Number),
        SemanticType::String => Ok(ColumnValues::Text(
            cells
                .iter()
                .map(|cell| match cell {
                    Value::String(text) => text.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        SemanticType::Rfctime => cells
            .iter()
            .map(|cell| {
                cell.as_str()
                    .and_then(parse_timestamp)
                    .ok_or_else(|| invalid(cell))
            })
            .collect::<Result<Vec<_>>>()
            .map(ColumnValues::Timestamp),
    }
}

fn parse_number(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Null => Some(f64::NAN),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    PARSE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

fn render_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}
