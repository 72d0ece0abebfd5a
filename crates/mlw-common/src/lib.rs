//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Shared primitives and utilities for the wrapper runtime."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Shared primitives for the ML wrapper workspace.
//! This crate exposes configuration loading, logging initialisation, and the
//! clock abstraction consumed by the messaging and reaction-cycle crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    split_topics, ConfigError, LoggingConfig, MessagingConfig, ModelConfig, MqttConfig,
    WrapperConfig,
};
pub use logging::{init_tracing, LogFormat, LogTarget};
pub use time::{format_timestamp, iso_timestamp, Clock, FixedClock, SystemClock};
