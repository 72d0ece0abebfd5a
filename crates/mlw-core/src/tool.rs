//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Reaction cycle orchestration and tool lifecycle."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use anyhow::Result;
use async_trait::async_trait;
use mlw_msg::{
    AnalysisOutput, EnvelopeKind, IncomingMessage, MessagingError, OutgoingMessage, ResultKind,
};
use serde::{Deserialize, Serialize};

/// Reaction policies of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOptions {
    /// Result kind passed to `set_results`; inferred from the value when unset.
    #[serde(default)]
    pub result_kind: Option<ResultKind>,
    /// Only messages of this envelope kind reach the tool.
    #[serde(default)]
    pub only_react_to: Option<EnvelopeKind>,
    /// Previous analysis results must be of one of these kinds.
    #[serde(default)]
    pub only_react_to_previous_result_kinds: Option<Vec<ResultKind>>,
    /// Publish results to the temporary sub topic.
    pub outgoing_is_temporary: bool,
}

impl ToolOptions {
    /// Options without reaction restrictions.
    pub fn new(outgoing_is_temporary: bool) -> Self {
        Self {
            result_kind: None,
            only_react_to: None,
            only_react_to_previous_result_kinds: None,
            outgoing_is_temporary,
        }
    }

    /// Fix the result kind instead of inferring it.
    pub fn with_result_kind(mut self, kind: ResultKind) -> Self {
        self.result_kind = Some(kind);
        self
    }

    /// Restrict the tool to one envelope kind.
    pub fn only_react_to(mut self, kind: EnvelopeKind) -> Self {
        self.only_react_to = Some(kind);
        self
    }

    /// Restrict previous analysis results to the given kinds.
    pub fn only_react_to_previous_result_kinds(
        mut self,
        kinds: impl IntoIterator<Item = ResultKind>,
    ) -> Self {
        self.only_react_to_previous_result_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Fail with `WrongMessageType` when `message` is excluded by policy.
    pub fn check(&self, message: &IncomingMessage) -> Result<(), MessagingError> {
        let Some(expected) = self.only_react_to else {
            return Ok(());
        };
        let kind = message.kind().ok_or_else(|| {
            MessagingError::NotInitialized("the message has not been classified".into())
        })?;
        if kind != expected {
            return Err(MessagingError::WrongMessageType(format!(
                "received a message of type {} but the tool only reacts to type {}",
                kind, expected
            )));
        }
        if kind != EnvelopeKind::AnalysisResult {
            return Ok(());
        }
        if let Some(allowed) = &self.only_react_to_previous_result_kinds {
            let previous = message.result_kind();
            if !previous.is_some_and(|previous| allowed.contains(&previous)) {
                return Err(MessagingError::WrongMessageType(format!(
                    "received a previously calculated result of type {} but the tool requires {}",
                    previous.map_or("unknown", ResultKind::as_str),
                    allowed
                        .iter()
                        .map(|kind| kind.as_str())
                        .collect::<Vec<_>>()
                        .join(" or ")
                )));
            }
        }
        Ok(())
    }
}

/// Analysis logic plugged into the reaction cycle.
///
/// Only [`AnalysisTool::run`] is required. The hooks around it default to
/// passing the incoming message through and to building the result body
/// with [`OutgoingMessage::set_results`].
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    /// Adjust the retrieved message before the analysis runs, e.g. by
    /// filling its custom information slot.
    async fn retrieve_payload_data(&self, incoming: IncomingMessage) -> Result<IncomingMessage> {
        Ok(incoming)
    }

    /// Compute the analysis for the message carried by `message`.
    async fn run(&self, message: &OutgoingMessage) -> Result<AnalysisOutput>;

    /// Turn the analysis value into the outgoing body.
    async fn resolve_result_data(
        &self,
        output: AnalysisOutput,
        mut message: OutgoingMessage,
        result_kind: Option<ResultKind>,
    ) -> Result<OutgoingMessage> {
        message.set_results(output, result_kind)?;
        Ok(message)
    }
}
