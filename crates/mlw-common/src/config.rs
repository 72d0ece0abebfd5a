//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Shared primitives and utilities for the wrapper runtime."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::{LogFormat, LogTarget};

fn default_mqtt_host() -> String {
    "localhost".to_owned()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_connect_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_request_topic() -> String {
    String::new()
}

fn default_qos() -> u8 {
    1
}

fn default_analytic_base_url() -> String {
    "kosmos/analytics/".to_owned()
}

fn default_base_result_topic() -> String {
    "kosmos/analyses/".to_owned()
}

fn default_temporary_keyword() -> String {
    "temporary".to_owned()
}

fn default_status_topic() -> String {
    "kosmos/status".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Errors raised while validating a resolved configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required identity field is missing or empty.
    #[error("config not valid: field `{field}` has to be set in the configuration file or its environment override")]
    ConfigNotValid {
        /// Dotted path of the offending field.
        field: &'static str,
    },
    /// A configured topic does not have a valid topic shape.
    #[error("topic '{0}' is not a valid topic")]
    InvalidTopic(String),
    /// QoS levels are limited to 0, 1, and 2.
    #[error("qos {0} is not a valid mqtt quality of service level")]
    InvalidQos(u8),
}

/// Primary configuration object for an analytics tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default)]
    pub raise_exceptions: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`WrapperConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedWrapperConfig {
    pub config: WrapperConfig,
    pub source: PathBuf,
}

impl WrapperConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MLW_CONFIG";

    /// Build a configuration with defaults around the given model identity.
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            mqtt: MqttConfig::default(),
            messaging: MessagingConfig::default(),
            status_topic: default_status_topic(),
            raise_exceptions: false,
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from disk, respecting the `MLW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedWrapperConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedWrapperConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedWrapperConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<WrapperConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants. Identity fields must be non-empty
    /// before a tool may report itself alive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        if self.messaging.qos > 2 {
            return Err(ConfigError::InvalidQos(self.messaging.qos));
        }
        split_topics(&self.messaging.request_topic, ',')?;
        Ok(())
    }

    /// Topics the tool subscribes to: the configured request topics followed
    /// by the model's own trigger topic.
    pub fn subscription_topics(&self) -> Result<Vec<String>, ConfigError> {
        let mut topics = split_topics(&self.messaging.request_topic, ',')?;
        topics.push(collapse_slashes(&format!(
            "{}/{}/{}",
            self.messaging.analytic_base_url, self.model.url, self.model.tag
        )));
        Ok(topics)
    }
}

impl std::str::FromStr for WrapperConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: WrapperConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of the model the tool publishes results for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub from: String,
}

impl ModelConfig {
    pub fn new(url: impl Into<String>, tag: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tag: tag.into(),
            from: from.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("model.url", &self.url),
            ("model.tag", &self.tag),
            ("model.from", &self.from),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ConfigNotValid { field });
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_connect_retry_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_retry_interval: Duration,
    /// Number of connection checks before giving up; `0` waits forever.
    #[serde(default)]
    pub connect_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            connect_retry_interval: default_connect_retry_interval(),
            connect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_analytic_base_url")]
    pub analytic_base_url: String,
    #[serde(default = "default_base_result_topic")]
    pub base_result_topic: String,
    #[serde(default = "default_temporary_keyword")]
    pub temporary_keyword: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            request_topic: default_request_topic(),
            qos: default_qos(),
            analytic_base_url: default_analytic_base_url(),
            base_result_topic: default_base_result_topic(),
            temporary_keyword: default_temporary_keyword(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub target: LogTarget,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write a daily rolling JSON file next to the stdout stream.
    #[serde(default)]
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            target: LogTarget::default(),
            file_prefix: None,
            file_output: false,
        }
    }
}

/// Split a separated topic list into validated topics. An empty string
/// yields no topics.
pub fn split_topics(topic_string: &str, sep: char) -> Result<Vec<String>, ConfigError> {
    if topic_string.trim().is_empty() {
        return Ok(Vec::new());
    }
    topic_string
        .split(sep)
        .map(|raw| {
            let topic = raw.trim();
            if is_topic_shape(topic) {
                Ok(topic.to_owned())
            } else {
                Err(ConfigError::InvalidTopic(raw.to_owned()))
            }
        })
        .collect()
}

/// `[/]segment(/segment)*[/]` with non-empty segments.
fn is_topic_shape(topic: &str) -> bool {
    let inner = topic.strip_prefix('/').unwrap_or(topic);
    let inner = inner.strip_suffix('/').unwrap_or(inner);
    !inner.is_empty() && inner.split('/').all(|segment| !segment.is_empty())
}

fn collapse_slashes(topic: &str) -> String {
    let mut collapsed = topic.to_owned();
    while collapsed.contains("//") {
        collapsed = collapsed.replace("//", "/");
    }
    collapsed
}
