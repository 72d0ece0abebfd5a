//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "binary"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Binary entrypoint replaying triggers through the reaction cycle."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use mlw_common::config::WrapperConfig;
use mlw_common::logging::{init_tracing, LogTarget};
use mlw_core::{AnalysisOutput, AnalysisTool, ReactionCycle, ToolOptions};
use mlw_msg::{InMemoryTransport, OutgoingMessage, RetrievedData};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replay trigger payloads through the reaction cycle",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Topic the triggers arrive on [default: the model's trigger topic]")]
    topic: Option<String>,

    #[arg(long, help = "Publish results to the temporary sub topic")]
    temporary: bool,

    #[arg(long, help = "Print the recorded metrics after the replay")]
    metrics: bool,

    #[arg(
        value_name = "TRIGGER",
        help = "Trigger payload files; one payload per stdin line when omitted"
    )]
    triggers: Vec<PathBuf>,
}

/// Answers every trigger with the data it carried.
struct PassthroughTool;

#[async_trait]
impl AnalysisTool for PassthroughTool {
    async fn run(&self, message: &OutgoingMessage) -> Result<AnalysisOutput> {
        Ok(match message.incoming().data()? {
            RetrievedData::SensorUpdate { table, .. } | RetrievedData::TimeSeries(table) => {
                table.clone().into()
            }
            RetrievedData::MultipleTimeSeries(tables) => tables.clone().into(),
            RetrievedData::Text(record) => record.clone().into(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/tool.toml"));

    let loaded = WrapperConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    // stdout carries the published messages
    config.logging.target = LogTarget::Stderr;
    init_tracing("mlw-replay", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let topic = match cli.topic {
        Some(topic) => topic,
        None => config
            .subscription_topics()?
            .pop()
            .context("configuration yields no trigger topic")?,
    };
    let payloads = read_payloads(&cli.triggers)?;

    let transport = InMemoryTransport::new();
    let registry = Registry::new();
    let cycle = ReactionCycle::builder(
        config,
        ToolOptions::new(cli.temporary),
        Arc::new(PassthroughTool),
        Arc::new(transport.clone()),
    )
    .metrics(&registry)
    .build()?;

    cycle.start_up().await?;
    for payload in &payloads {
        transport.inject(&topic, payload);
    }
    cycle.shut_down().await?;

    for message in transport.published() {
        let payload = serde_json::from_str::<Value>(&message.payload)
            .unwrap_or_else(|_| Value::String(message.payload.clone()));
        println!(
            "{}",
            json!({"topic": message.topic, "qos": message.qos, "payload": payload})
        );
    }
    if cli.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        eprint!("{}", String::from_utf8_lossy(&buffer));
    }
    info!(triggers = payloads.len(), topic = %topic, "replay finished");
    Ok(())
}

fn read_payloads(paths: &[PathBuf]) -> Result<Vec<String>> {
    if paths.is_empty() {
        let mut payloads = Vec::new();
        for line in std::io::stdin().lock().lines() {
            let line = line.context("failed to read stdin")?;
            if !line.trim().is_empty() {
                payloads.push(line);
            }
        }
        return Ok(payloads);
    }
    paths
        .iter()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("unable to read trigger {}", path.display()))
        })
        .collect()
}
