//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Reaction cycle orchestration and tool lifecycle."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use mlw_msg::{log_message, MessageDirection, Transport, WrapperMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Status messages are fire and forget.
const STATUS_QOS: u8 = 0;

/// Liveness state of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolState {
    /// Components are starting.
    #[serde(rename = "starting")]
    Starting,
    /// Connected and subscribed.
    #[serde(rename = "alive")]
    Alive,
    /// A message failed.
    #[serde(rename = "error")]
    Error,
    /// Teardown started.
    #[serde(rename = "shutting down")]
    ShuttingDown,
}

impl ToolState {
    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolState::Starting => "starting",
            ToolState::Alive => "alive",
            ToolState::Error => "error",
            ToolState::ShuttingDown => "shutting down",
        }
    }
}

impl fmt::Display for ToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single writer of the tool's last published state.
///
/// Setting a state publishes `{"status", "from"}` to the status topic, but
/// only when the state changed and the transport is connected. The lock is
/// held while publishing so overlapping transitions cannot reorder.
/// `shutting down` is terminal.
pub struct StateReporter {
    transport: Arc<dyn Transport>,
    topic: String,
    from: String,
    current: Mutex<Option<ToolState>>,
    metrics: Option<WrapperMetrics>,
}

impl fmt::Debug for StateReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateReporter")
            .field("transport", &self.transport.name())
            .field("topic", &self.topic)
            .field("from", &self.from)
            .field("current", &*self.current.lock())
            .finish()
    }
}

impl StateReporter {
    /// Reporter publishing to `topic` on behalf of tool `from`.
    pub fn new(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            from: from.into(),
            current: Mutex::new(None),
            metrics: None,
        }
    }

    /// Mirror every transition into the `ml_wrapper_state` gauge.
    pub fn with_metrics(mut self, metrics: WrapperMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Last recorded state.
    pub fn state(&self) -> Option<ToolState> {
        *self.current.lock()
    }

    /// Record `state`. Returns whether a status message was published.
    pub fn set(&self, state: ToolState) -> bool {
        let mut current = self.current.lock();
        if *current == Some(state) {
            return false;
        }
        if *current == Some(ToolState::ShuttingDown) {
            debug!(state = %state, "ignoring transition after shutdown started");
            return false;
        }
        *current = Some(state);
        if let Some(metrics) = &self.metrics {
            metrics.set_state(state.as_str());
        }
        if !self.transport.is_connected() {
            warn!(
                state = %state,
                "state changed while disconnected, status message dropped"
            );
            return false;
        }
        let payload = json!({"status": state.as_str(), "from": self.from}).to_string();
        match self.transport.publish(&self.topic, &payload, STATUS_QOS) {
            Ok(()) => {
                log_message(MessageDirection::Outbound, &self.topic, &payload);
                info!(state = %state, topic = %self.topic, "tool state published");
                true
            }
            Err(err) => {
                warn!(state = %state, error = %err, "failed to publish tool state");
                false
            }
        }
    }
}
