//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntGaugeVec, Opts, Registry};
use tracing::debug;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message published to the bus.
    Outbound,
    /// Message received from the bus.
    Inbound,
}

/// Emit a structured log entry for bus traffic.
pub fn log_message(direction: MessageDirection, topic: &str, payload: &str) {
    debug!(
        topic = %topic,
        bytes = payload.len(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for the wrapper.
#[derive(Clone)]
pub struct WrapperMetrics {
    message_issues: IntCounter,
    errors: IntCounter,
    state: IntGaugeVec,
}

impl WrapperMetrics {
    /// Register wrapper metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let message_issues = IntCounter::with_opts(Opts::new(
            "message_issues",
            "Inbound messages that could not be classified or retrieved",
        ))?;
        let errors = IntCounter::with_opts(Opts::new(
            "error_counter",
            "Contained failures of the reaction cycle",
        ))?;
        let state = IntGaugeVec::new(
            Opts::new("ml_wrapper_state", "Current tool state, 1 for the active state"),
            &["state"],
        )?;

        registry.register(Box::new(message_issues.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(state.clone()))?;

        Ok(Self {
            message_issues,
            errors,
            state,
        })
    }

    /// Record an inbound message that failed classification or retrieval.
    pub fn observe_message_issue(&self) {
        self.message_issues.inc();
    }

    /// Record a contained failure.
    pub fn observe_error(&self) {
        self.errors.inc();
    }

    /// Mark `current` as the active state.
    pub fn set_state(&self, current: &str) {
        self.state.reset();
        self.state.with_label_values(&[current]).set(1);
    }
}
