//! Execution engine: runs a validated plan against a sandbox.
//!
//! Steps run strictly in order. The first failure aborts the plan; there
//! is no retry and no rollback (the sandbox is the rollback). Cancellation
//! is only observed between steps.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StepExecutionError;
use crate::plan::{ValidatedPlan, ValidatedStep};
use crate::recorder::{FlightEvent, FlightRecorder, Scope};
use crate::sandbox::SandboxHandle;
use crate::skills::SkillContext;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag so the token can be reused for the next plan.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub step_id: String,
    pub capability: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbortReason {
    StepFailed { detail: String },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed { detail } => write!(f, "step failed: {detail}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal state of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    Aborted {
        /// The failed step, or the first step not run after cancellation.
        step_index: usize,
        step_id: String,
        reason: AbortReason,
    },
}

/// Everything the caller learns about a plan run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub results: Vec<StepResult>,
    pub status: PlanStatus,
}

impl ExecutionReport {
    pub fn is_completed(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            PlanStatus::Completed => writeln!(
                f,
                "Plan {} completed ({} steps)",
                self.plan_id,
                self.results.len()
            )?,
            PlanStatus::Aborted {
                step_index,
                step_id,
                reason,
            } => writeln!(
                f,
                "Plan {} aborted at step {} ({step_id}): {reason}",
                self.plan_id,
                step_index + 1
            )?,
        }
        for result in &self.results {
            let mark = if result.succeeded() { "ok" } else { "FAILED" };
            writeln!(
                f,
                "  [{}] {} ({}) {mark} in {}ms",
                result.index + 1,
                result.capability,
                result.step_id,
                result.duration_ms
            )?;
            if let Some(error) = &result.error {
                for line in error.lines() {
                    writeln!(f, "      {line}")?;
                }
            }
        }
        Ok(())
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Walks validated plans step by step.
pub struct ExecutionEngine {
    step_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Runs `plan` against `sandbox`, recording every transition.
    ///
    /// Step failures are part of the report, not errors.
    pub async fn execute(
        &self,
        plan: &ValidatedPlan,
        sandbox: &SandboxHandle,
        recorder: &mut FlightRecorder,
        cancel: &CancelToken,
    ) -> ExecutionReport {
        let plan_id = plan.plan_id();
        let session_id = recorder.session_id();
        let mut results = Vec::with_capacity(plan.len());

        info!("Executing plan {plan_id} ({} steps)", plan.len());

        for step in plan.steps() {
            let scope = Scope::step(plan_id, step.step_id());

            if cancel.is_cancelled() {
                warn!("Plan {plan_id} cancelled before step {}", step.step_id());
                recorder.append(
                    scope,
                    FlightEvent::PlanAborted {
                        step_index: Some(step.index()),
                        reason: AbortReason::Cancelled.to_string(),
                    },
                );
                return ExecutionReport {
                    plan_id: plan_id.to_string(),
                    results,
                    status: PlanStatus::Aborted {
                        step_index: step.index(),
                        step_id: step.step_id().to_string(),
                        reason: AbortReason::Cancelled,
                    },
                };
            }

            recorder.append(
                scope,
                FlightEvent::StepStarted {
                    index: step.index(),
                    capability: step.capability().to_string(),
                },
            );

            let start = Instant::now();
            let context = SkillContext::new(session_id, step.step_id(), sandbox);
            let outcome = self.invoke(step, &context).await;
            let duration_ms = elapsed_ms(start);

            match outcome {
                Ok(output) => {
                    info!(
                        "Step {} ({}) succeeded in {duration_ms}ms",
                        step.step_id(),
                        step.capability()
                    );
                    recorder.append(
                        scope,
                        FlightEvent::StepSucceeded {
                            index: step.index(),
                            duration_ms,
                        },
                    );
                    results.push(StepResult {
                        index: step.index(),
                        step_id: step.step_id().to_string(),
                        capability: step.capability().to_string(),
                        outcome: StepOutcome::Success,
                        output: Some(output),
                        error: None,
                        duration_ms,
                    });
                }
                Err(e) => {
                    let detail = e.to_string();
                    warn!(
                        "Step {} ({}) failed: {detail}",
                        step.step_id(),
                        step.capability()
                    );
                    recorder.append(
                        scope,
                        FlightEvent::StepFailed {
                            index: step.index(),
                            error: detail.clone(),
                            duration_ms,
                        },
                    );
                    results.push(StepResult {
                        index: step.index(),
                        step_id: step.step_id().to_string(),
                        capability: step.capability().to_string(),
                        outcome: StepOutcome::Failure,
                        output: None,
                        error: Some(detail.clone()),
                        duration_ms,
                    });

                    let reason = AbortReason::StepFailed { detail };
                    recorder.append(
                        scope,
                        FlightEvent::PlanAborted {
                            step_index: Some(step.index()),
                            reason: reason.to_string(),
                        },
                    );
                    return ExecutionReport {
                        plan_id: plan_id.to_string(),
                        results,
                        status: PlanStatus::Aborted {
                            step_index: step.index(),
                            step_id: step.step_id().to_string(),
                            reason,
                        },
                    };
                }
            }
        }

        recorder.append(
            Scope::plan(plan_id),
            FlightEvent::PlanCompleted {
                steps: results.len(),
            },
        );
        info!("Plan {plan_id} completed");

        ExecutionReport {
            plan_id: plan_id.to_string(),
            results,
            status: PlanStatus::Completed,
        }
    }

    async fn invoke(
        &self,
        step: &ValidatedStep,
        context: &SkillContext<'_>,
    ) -> Result<Value, StepExecutionError> {
        let call = step.entry().execute(step.args().clone(), context);
        match tokio::time::timeout(self.step_timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(StepExecutionError::Skill(e)),
            Err(_) => Err(StepExecutionError::Timeout(self.step_timeout.as_secs())),
        }
    }
}
