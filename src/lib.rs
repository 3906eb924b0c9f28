//! Sovereign agent: a local runtime that checks plans from an external
//! planner against a registry of capabilities, runs them in a disposable
//! copy of the workspace, and records every decision to a per-session
//! flight record.
//!
//! ```text
//!   TaskPlan ──validate──► ValidatedPlan ──ExecutionEngine──► ExecutionReport
//!                 ▲                              │
//!           SkillRegistry                 SandboxHandle ──reconcile/discard──► workspace
//!                                                │
//!                                         FlightRecorder (.sovereign/flight/*.jsonl)
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod plan;
pub mod recorder;
pub mod sandbox;
pub mod skills;

pub use agent::{AgentRuntime, ExecutionReport, Session};
pub use config::Config;
pub use plan::TaskPlan;
