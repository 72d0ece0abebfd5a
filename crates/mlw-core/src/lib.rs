//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Reaction cycle orchestration and tool lifecycle."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Reaction cycle for analytics tools: receive a trigger, run the tool,
//! publish its result, and report the tool's liveness state.

pub mod cycle;
pub mod state;
pub mod tool;

pub use cycle::{shutdown_signal, CycleError, ReactionCycle, ReactionCycleBuilder};
pub use mlw_msg::AnalysisOutput;
pub use state::{StateReporter, ToolState};
pub use tool::{AnalysisTool, ToolOptions};
