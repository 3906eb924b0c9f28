pub mod engine;
pub mod runtime;

pub use engine::{
    AbortReason, CancelToken, ExecutionEngine, ExecutionReport, PlanStatus, StepOutcome,
    StepResult,
};
pub use runtime::{AgentRuntime, Session};
