//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Envelope kind of a trigger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// New sensor data arrived.
    #[serde(rename = "sensor_update")]
    SensorUpdate,
    /// Another tool published an analysis result.
    #[serde(rename = "analyse_result")]
    AnalysisResult,
}

impl EnvelopeKind {
    /// Every envelope kind, in lookup order.
    pub const ALL: [EnvelopeKind; 2] = [EnvelopeKind::SensorUpdate, EnvelopeKind::AnalysisResult];

    /// Wire name carried in `body.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::SensorUpdate => "sensor_update",
            EnvelopeKind::AnalysisResult => "analyse_result",
        }
    }

    /// Look a wire name up in the kind table.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Record with at least `total` and `predict`.
    Text,
    /// Exactly one table.
    TimeSeries,
    /// Ordered list of tables.
    MultipleTimeSeries,
}

impl ResultKind {
    /// Every result kind, in lookup order.
    pub const ALL: [ResultKind; 3] = [
        ResultKind::Text,
        ResultKind::TimeSeries,
        ResultKind::MultipleTimeSeries,
    ];

    /// Wire name carried in the analysis body `type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Text => "text",
            ResultKind::TimeSeries => "time_series",
            ResultKind::MultipleTimeSeries => "multiple_time_series",
        }
    }

    /// Look a wire name up in the result kind table.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_closed() {
        assert_eq!(
            EnvelopeKind::lookup("analyse_result"),
            Some(EnvelopeKind::AnalysisResult)
        );
        assert_eq!(EnvelopeKind::lookup("analysis_result"), None);
        assert_eq!(
            ResultKind::lookup("multiple_time_series"),
            Some(ResultKind::MultipleTimeSeries)
        );
        assert_eq!(ResultKind::lookup("TEXT"), None);
    }

    #[test]
    fn serde_names_match_wire_names() {
        for kind in ResultKind::ALL {
            let rendered = serde_json::to_value(kind).expect("serialize");
            assert_eq!(rendered, serde_json::Value::from(kind.as_str()));
        }
        let rendered = serde_json::to_value(EnvelopeKind::SensorUpdate).expect("serialize");
        assert_eq!(rendered, "sensor_update");
    }
}
