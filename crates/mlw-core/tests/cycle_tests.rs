//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "tests"
//! mlw_type: "test"
//! mlw_scope: "code"
//! mlw_description: "Reaction cycle behaviour against the in-memory transport."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mlw_common::config::{ModelConfig, WrapperConfig};
use mlw_common::time::FixedClock;
use mlw_core::{AnalysisOutput, AnalysisTool, CycleError, ReactionCycle, ToolOptions, ToolState};
use mlw_msg::{
    EnvelopeKind, InMemoryTransport, IncomingMessage, MessagingError, OutgoingMessage,
    ResultKind, RetrievedData, Transport,
};
use parking_lot::Mutex;
use prometheus::Registry;
use serde_json::{json, Value};

const TRIGGER_TOPIC: &str = "kosmos/analytics/fft/v1";
const STATUS_TOPIC: &str = "kosmos/status";

fn sensor_update(contract: &str) -> String {
    json!({
        "body": {
            "type": "sensor_update",
            "machine": "press-07",
            "sensor": "oil-temp",
            "contract": contract,
            "payload": {
                "body": {
                    "columns": [
                        {"name": "t", "type": "rfctime"},
                        {"name": "v", "type": "number"}
                    ],
                    "data": [
                        ["2020-01-20T10:10:00", "2020-01-20T10:10:02"],
                        ["1.5", "2"]
                    ]
                },
                "signature": ""
            }
        }
    })
    .to_string()
}

fn text_result(contract: &str) -> String {
    json!({
        "body": {
            "type": "analyse_result",
            "machine": "press-07",
            "sensor": "oil-temp",
            "contract": contract,
            "payload": {
                "body": {
                    "type": "text",
                    "from": "classifier",
                    "model": {"url": "classifier", "tag": "v1"},
                    "calculated": {
                        "message": {"machine": "press-07", "sensor": "oil-temp"},
                        "received": "2020-01-20T10:10:04.000000+00:00"
                    },
                    "results": {"total": "ok", "predict": 0.93}
                },
                "signature": ""
            }
        }
    })
    .to_string()
}

fn config(raise_exceptions: bool) -> WrapperConfig {
    let mut config = WrapperConfig::new(ModelConfig::new("fft", "v1", "fft-tool"));
    config.raise_exceptions = raise_exceptions;
    config.messaging.request_topic = "kosmos/analytics/shared/latest".into();
    config
}

#[derive(Default)]
struct EchoTool {
    runs: AtomicUsize,
}

#[async_trait]
impl AnalysisTool for EchoTool {
    async fn run(&self, message: &OutgoingMessage) -> Result<AnalysisOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match message.incoming().data()? {
            RetrievedData::SensorUpdate { table, .. } => Ok(table.clone().into()),
            RetrievedData::Text(record) => Ok(record.clone().into()),
            other => bail!("unexpected data {:?}", other.result_kind()),
        }
    }
}

fn echo() -> Arc<EchoTool> {
    Arc::new(EchoTool::default())
}

/// Fills the custom information slot and remembers what `run` saw.
#[derive(Default)]
struct ThresholdTool {
    seen: Mutex<Option<Value>>,
}

#[async_trait]
impl AnalysisTool for ThresholdTool {
    async fn retrieve_payload_data(
        &self,
        mut incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        let machine = incoming.machine().unwrap_or_default().to_owned();
        incoming.custom_information = Some(json!({"threshold": 0.7, "machine": machine}));
        Ok(incoming)
    }

    async fn run(&self, message: &OutgoingMessage) -> Result<AnalysisOutput> {
        *self.seen.lock() = message.incoming().custom_information.clone();
        match message.incoming().data()? {
            RetrievedData::SensorUpdate { table, .. } => Ok(table.clone().into()),
            other => bail!("unexpected data {:?}", other.result_kind()),
        }
    }
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

struct PanickingTool;

#[async_trait]
impl AnalysisTool for PanickingTool {
    async fn run(&self, _message: &OutgoingMessage) -> Result<AnalysisOutput> {
        panic!("model exploded");
    }
}

struct FailingTool;

#[async_trait]
impl AnalysisTool for FailingTool {
    async fn run(&self, _message: &OutgoingMessage) -> Result<AnalysisOutput> {
        bail!("model weights missing")
    }
}

struct ForgetfulTool;

#[async_trait]
impl AnalysisTool for ForgetfulTool {
    async fn run(&self, _message: &OutgoingMessage) -> Result<AnalysisOutput> {
        let mut record = serde_json::Map::new();
        record.insert("total".into(), json!(1));
        record.insert("predict".into(), json!(0.5));
        Ok(record.into())
    }

    async fn resolve_result_data(
        &self,
        _output: AnalysisOutput,
        message: OutgoingMessage,
        _result_kind: Option<ResultKind>,
    ) -> Result<OutgoingMessage> {
        Ok(message)
    }
}

fn cycle_with(
    config: WrapperConfig,
    options: ToolOptions,
    tool: Arc<dyn AnalysisTool>,
) -> (ReactionCycle, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let clock = FixedClock(Utc.with_ymd_and_hms(2020, 1, 20, 10, 10, 6).unwrap());
    let cycle = ReactionCycle::builder(config, options, tool, Arc::new(transport.clone()))
        .clock(Arc::new(clock))
        .build()
        .expect("cycle builds");
    (cycle, transport)
}

fn statuses(transport: &InMemoryTransport) -> Vec<String> {
    transport
        .published_to(STATUS_TOPIC)
        .into_iter()
        .map(|message| {
            let status: Value = serde_json::from_str(&message.payload).expect("status json");
            status["status"].as_str().expect("status string").to_owned()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_up_subscribes_and_reports_alive() {
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), echo());
    cycle.start_up().await.expect("starts");

    assert_eq!(statuses(&transport), vec!["starting", "alive"]);
    assert_eq!(
        transport.subscriptions(),
        vec![
            ("kosmos/analytics/shared/latest".to_owned(), 1),
            (TRIGGER_TOPIC.to_owned(), 1)
        ]
    );
    let status: Value =
        serde_json::from_str(&transport.published_to(STATUS_TOPIC)[1].payload).expect("json");
    assert_eq!(status, json!({"status": "alive", "from": "fft-tool"}));
    assert_eq!(cycle.state(), Some(ToolState::Alive));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_subscription_keeps_tool_from_alive() {
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), echo());
    transport.reject_subscription(TRIGGER_TOPIC);
    let err = cycle.start_up().await.expect_err("subscription rejected");
    assert_eq!(err.name(), "TransportError");
    assert_eq!(cycle.state(), Some(ToolState::Error));
    assert!(!statuses(&transport).contains(&"alive".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_fails_start_up() {
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), echo());
    transport.refuse_connections(true);
    assert!(cycle.start_up().await.is_err());
    assert!(transport.published().is_empty());
}

#[test]
fn empty_tool_name_is_rejected_at_build() {
    let mut config = config(false);
    config.model.from = String::new();
    let err = ReactionCycle::new(
        config,
        ToolOptions::new(false),
        echo(),
        Arc::new(InMemoryTransport::new()),
    )
    .expect_err("config not valid");
    assert_eq!(err.name(), "ConfigNotValid");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sensor_update_publishes_time_series_result() {
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), echo());
    transport.set_connected(true);

    let outgoing = cycle
        .react(TRIGGER_TOPIC, &sensor_update("contract-42"))
        .await
        .expect("reaction succeeds")
        .expect("result published");
    assert_eq!(outgoing.result_kind(), Some(ResultKind::TimeSeries));

    let published = transport.published_to("kosmos/analyses/contract-42");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].qos, 1);
    let result: Value = serde_json::from_str(&published[0].payload).expect("result json");
    let body = &result["body"];
    assert_eq!(body["type"], "time_series");
    assert_eq!(body["from"], "fft-tool");
    assert_eq!(body["model"], json!({"url": "fft", "tag": "v1"}));
    assert_eq!(
        body["calculated"]["message"],
        json!({"machine": "press-07", "sensor": "oil-temp"})
    );
    assert_eq!(body["timestamp"], "2020-01-20T10:10:06.000000+00:00");
    assert_eq!(body["results"]["data"][1], json!(["1.5", "2.0"]));
    assert_eq!(result["signature"], "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn temporary_results_use_the_keyword_sub_topic() {
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(true), echo());
    transport.set_connected(true);
    cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("reaction succeeds");
    assert_eq!(transport.published_to("kosmos/analyses/c1/temporary").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_is_contained_and_cycle_continues() {
    let tool = echo();
    let registry = Registry::new();
    let transport = InMemoryTransport::new();
    let cycle = ReactionCycle::builder(
        config(false),
        ToolOptions::new(false),
        tool.clone(),
        Arc::new(transport.clone()),
    )
    .metrics(&registry)
    .build()
    .expect("cycle builds");
    cycle.start_up().await.expect("starts");

    let contained = cycle
        .react(TRIGGER_TOPIC, "{not json")
        .await
        .expect("contained without raise_exceptions");
    assert!(contained.is_none());
    assert_eq!(cycle.state(), Some(ToolState::Error));

    let published = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("next message handled");
    assert!(published.is_some());
    assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    assert_eq!(statuses(&transport), vec!["starting", "alive", "error"]);

    let families = registry.gather();
    let counter = |name: &str| {
        families
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_counter().get_value())
    };
    assert_eq!(counter("message_issues"), Some(1.0));
    assert_eq!(counter("error_counter"), Some(1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raise_exceptions_hands_failures_back() {
    let (cycle, transport) = cycle_with(config(true), ToolOptions::new(false), echo());
    transport.set_connected(true);
    let err = cycle
        .react(TRIGGER_TOPIC, r#"{"body": {"type": "unknown"}}"#)
        .await
        .expect_err("re-raised");
    assert!(matches!(
        err,
        CycleError::Messaging(MessagingError::NonSchemaConformJsonPayload(_))
    ));
    assert_eq!(cycle.state(), Some(ToolState::Error));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn policy_rejection_is_never_raised() {
    let tool = echo();
    let options = ToolOptions::new(false).only_react_to(EnvelopeKind::AnalysisResult);
    let (cycle, transport) = cycle_with(config(true), options, tool.clone());
    transport.set_connected(true);

    let outcome = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("policy rejections are contained");
    assert!(outcome.is_none());
    assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
    assert_eq!(cycle.state(), Some(ToolState::Error));
    assert!(transport.published_to("kosmos/analyses/c1").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_panic_is_contained() {
    let (cycle, transport) =
        cycle_with(config(false), ToolOptions::new(false), Arc::new(PanickingTool));
    transport.set_connected(true);
    let outcome = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("panic contained");
    assert!(outcome.is_none());
    assert_eq!(cycle.state(), Some(ToolState::Error));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_error_is_raised_when_configured() {
    let (cycle, transport) =
        cycle_with(config(true), ToolOptions::new(false), Arc::new(FailingTool));
    transport.set_connected(true);
    let err = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect_err("tool error re-raised");
    assert_eq!(err.name(), "ToolError");
    assert!(err.to_string().contains("model weights missing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overridden_resolver_without_body_publishes_nothing() {
    let (cycle, transport) =
        cycle_with(config(true), ToolOptions::new(false), Arc::new(ForgetfulTool));
    transport.set_connected(true);
    let err = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect_err("missing body surfaces");
    assert_eq!(err.name(), "NotInitialized");
    assert!(transport.published_to("kosmos/analyses/c1").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn injected_messages_are_handled_until_shutdown() {
    let tool = echo();
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), tool.clone());

    assert!(!transport.inject(TRIGGER_TOPIC, &sensor_update("early")));
    cycle.start_up().await.expect("starts");
    for contract in ["c1", "c2", "c3"] {
        assert!(transport.inject(TRIGGER_TOPIC, &sensor_update(contract)));
    }
    cycle.shut_down().await.expect("shuts down");

    assert_eq!(tool.runs.load(Ordering::SeqCst), 3);
    assert_eq!(cycle.in_flight(), 0);
    for contract in ["c1", "c2", "c3"] {
        assert_eq!(
            transport
                .published()
                .iter()
                .filter(|message| message.topic == format!("kosmos/analyses/{contract}"))
                .count(),
            1
        );
    }
    assert_eq!(statuses(&transport).last().map(String::as_str), Some("shutting down"));
    assert!(!transport.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_after_shutdown_are_dropped() {
    let tool = echo();
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), tool.clone());
    cycle
        .run_until(async {})
        .await
        .expect("runs and stops");
    transport.set_connected(true);
    transport.inject(TRIGGER_TOPIC, &sensor_update("late"));
    assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
    assert_eq!(cycle.state(), Some(ToolState::ShuttingDown));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn previous_result_kind_outside_allowed_set_is_rejected() {
    let tool = echo();
    let options = ToolOptions::new(false)
        .only_react_to(EnvelopeKind::AnalysisResult)
        .only_react_to_previous_result_kinds([ResultKind::TimeSeries]);
    let (cycle, transport) = cycle_with(config(true), options, tool.clone());
    transport.set_connected(true);

    let outcome = cycle
        .react(TRIGGER_TOPIC, &text_result("c1"))
        .await
        .expect("policy rejections are contained");
    assert!(outcome.is_none());
    assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
    assert_eq!(cycle.state(), Some(ToolState::Error));
    assert!(transport.published_to("kosmos/analyses/c1").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn previous_result_kind_inside_allowed_set_reaches_tool() {
    let tool = echo();
    let options = ToolOptions::new(false)
        .only_react_to(EnvelopeKind::AnalysisResult)
        .only_react_to_previous_result_kinds([ResultKind::TimeSeries, ResultKind::Text]);
    let (cycle, transport) = cycle_with(config(true), options, tool.clone());
    transport.set_connected(true);

    let outgoing = cycle
        .react(TRIGGER_TOPIC, &text_result("c1"))
        .await
        .expect("reaction succeeds")
        .expect("result published");
    assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    assert_eq!(outgoing.result_kind(), Some(ResultKind::Text));

    let published = transport.published_to("kosmos/analyses/c1");
    assert_eq!(published.len(), 1);
    let result: Value = serde_json::from_str(&published[0].payload).expect("result json");
    assert_eq!(result["body"]["type"], "text");
    assert_eq!(result["body"]["results"], json!({"total": "ok", "predict": 0.93}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_information_is_filled_before_run() {
    let tool = Arc::new(ThresholdTool::default());
    let (cycle, transport) = cycle_with(config(true), ToolOptions::new(false), tool.clone());
    transport.set_connected(true);

    let outgoing = cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("reaction succeeds")
        .expect("result published");
    let expected = json!({"threshold": 0.7, "machine": "press-07"});
    assert_eq!(tool.seen.lock().clone(), Some(expected.clone()));
    assert_eq!(outgoing.incoming().custom_information, Some(expected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_started_reaction_publishes_before_disconnect() {
    let tool = echo();
    let (cycle, transport) = cycle_with(config(false), ToolOptions::new(false), tool.clone());
    cycle.start_up().await.expect("starts");

    let injector = transport.clone();
    let feeding = tokio::task::spawn_blocking(move || {
        for index in 0..200 {
            injector.inject(TRIGGER_TOPIC, &sensor_update(&format!("c{index}")));
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    cycle.shut_down().await.expect("shuts down");
    feeding.await.expect("injector finished");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let results = transport
        .published()
        .iter()
        .filter(|message| message.topic.starts_with("kosmos/analyses/"))
        .count();
    assert_eq!(tool.runs.load(Ordering::SeqCst), results);
    assert_eq!(cycle.in_flight(), 0);
    assert!(!transport.is_connected());
}

#[tokio::test(flavor = "current_thread")]
async fn custom_result_base_is_honoured_and_stray_topics_still_publish() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut config = config(false);
    config.messaging.base_result_topic = "plant/results/".into();
    let (cycle, transport) = cycle_with(config, ToolOptions::new(false), echo());
    transport.set_connected(true);

    cycle
        .react(TRIGGER_TOPIC, &sensor_update("c1"))
        .await
        .expect("reaction succeeds")
        .expect("result published");
    assert_eq!(transport.published_to("plant/results/c1").len(), 1);
    assert!(!logs.contents().contains("publishing to a topic outside"));

    cycle
        .react(TRIGGER_TOPIC, &sensor_update("/"))
        .await
        .expect("reaction succeeds")
        .expect("stray topic still published");
    assert_eq!(transport.published_to("plant/results/").len(), 1);
    assert!(logs.contents().contains("publishing to a topic outside"));
}
