//! 核心：错误分层与编排主控

pub mod error;
pub mod orchestrator;

pub use error::{GateError, OrchestratorError, PlanningError, SynthesisError, TaskError};
pub use orchestrator::{Orchestrator, RunOutcome};
