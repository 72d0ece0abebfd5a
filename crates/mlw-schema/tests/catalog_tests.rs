//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "tests"
//! mlw_type: "test"
//! mlw_scope: "code"
//! mlw_description: "Validation behaviour of the embedded payload schemas."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::sync::Arc;

use mlw_schema::{SchemaCatalog, SchemaError, SchemaId};
use serde_json::{json, Value};

fn catalog() -> Arc<SchemaCatalog> {
    SchemaCatalog::shared().expect("embedded schemas compile")
}

fn analysis(kind: &str, results: Value) -> Value {
    json!({
        "body": {
            "type": kind,
            "from": "fft-tool",
            "model": {"url": "fft", "tag": "v1"},
            "calculated": {
                "message": {"machine": "m1", "sensor": "s1"},
                "received": "2020-01-20T10:10:00.000000+00:00"
            },
            "results": results,
            "timestamp": "2020-01-20T10:10:01.000000+00:00"
        },
        "signature": ""
    })
}

fn table() -> Value {
    json!({
        "columns": [
            {"name": "time", "type": "rfctime"},
            {"name": "value", "type": "number"}
        ],
        "data": [["2020-01-20 10:10:00"], ["0.5"]]
    })
}

#[test]
fn trigger_envelope_requires_routing_fields() {
    let trigger = json!({
        "body": {
            "type": "sensor_update",
            "machine": "m1",
            "sensor": "s1",
            "contract": "c1",
            "payload": {"body": {"columns": [], "data": []}}
        }
    });
    assert!(catalog().validate(&trigger, SchemaId::Trigger).is_ok());

    let mut missing_contract = trigger.clone();
    missing_contract["body"]
        .as_object_mut()
        .expect("object")
        .remove("contract");
    let err = catalog()
        .validate(&missing_contract, SchemaId::Trigger)
        .expect_err("contract is required");
    assert!(err.to_string().contains("contract"));
}

#[test]
fn trigger_type_must_be_known_kind() {
    let trigger = json!({
        "body": {
            "type": "weather_report",
            "machine": "m1",
            "sensor": "s1",
            "contract": "c1",
            "payload": {}
        }
    });
    assert!(!catalog().is_valid(&trigger, SchemaId::Trigger));
}

#[test]
fn sensor_update_accepts_column_metadata() {
    let update = json!({
        "body": {
            "columns": [
                {"name": "time", "type": "rfctime"},
                {"name": "temp", "type": "number", "unit": "C", "description": "oil", "future": false}
            ],
            "data": [["2020-01-20T10:10:00Z"], [21.5]],
            "meta": {"plant": "north"},
            "timestamp": "2020-01-20T10:10:00Z"
        }
    });
    assert!(catalog().validate(&update, SchemaId::SensorUpdate).is_ok());
}

#[test]
fn sensor_update_rejects_unknown_semantic_type() {
    let update = json!({
        "body": {
            "columns": [{"name": "temp", "type": "complex"}],
            "data": [["1+2i"]]
        }
    });
    assert!(matches!(
        catalog().validate(&update, SchemaId::SensorUpdate),
        Err(SchemaError::Violation { schema: SchemaId::SensorUpdate, .. })
    ));
}

#[test]
fn analysis_results_follow_result_kind() {
    assert!(catalog()
        .validate(&analysis("time_series", table()), SchemaId::AnalysisResult)
        .is_ok());
    assert!(catalog()
        .validate(
            &analysis("multiple_time_series", json!([table(), table()])),
            SchemaId::AnalysisResult
        )
        .is_ok());
    assert!(catalog()
        .validate(
            &analysis("text", json!({"total": 3, "predict": "ok"})),
            SchemaId::AnalysisResult
        )
        .is_ok());

    assert!(!catalog().is_valid(&analysis("time_series", json!([table()])), SchemaId::AnalysisResult));
    assert!(!catalog().is_valid(&analysis("text", json!({"total": 3})), SchemaId::AnalysisResult));
}

#[test]
fn empty_table_is_a_valid_time_series_but_no_table_list_is_not() {
    let empty = json!({"columns": [], "data": []});
    assert!(catalog().is_valid(&analysis("time_series", empty), SchemaId::AnalysisResult));
    assert!(!catalog().is_valid(&analysis("multiple_time_series", json!([])), SchemaId::AnalysisResult));
}

#[test]
fn analysis_result_requires_signature() {
    let mut payload = analysis("time_series", table());
    payload.as_object_mut().expect("object").remove("signature");
    assert!(!catalog().is_valid(&payload, SchemaId::AnalysisResult));
}
