use std::collections::HashSet;

use tracing::debug;

use super::{TaskPlan, ValidatedPlan, ValidatedStep};
use crate::error::ValidationError;
use crate::skills::SkillRegistry;

/// Checks `plan` against `registry`.
///
/// Steps are checked in order and the first failing one is reported. No
/// side effects: nothing runs and nothing is recorded here.
pub fn validate(registry: &SkillRegistry, plan: &TaskPlan) -> Result<ValidatedPlan, ValidationError> {
    if plan.steps.is_empty() {
        return Err(ValidationError::EmptyPlan {
            plan_id: plan.plan_id.clone(),
        });
    }

    let mut seen_ids = HashSet::new();
    let mut steps = Vec::with_capacity(plan.steps.len());

    for (index, step) in plan.steps.iter().enumerate() {
        let descriptor =
            registry
                .get(&step.capability)
                .ok_or_else(|| ValidationError::UnknownCapability {
                    index,
                    name: step.capability.clone(),
                })?;

        let args = descriptor.schema().validate(&step.args).map_err(|e| {
            ValidationError::InvalidArgument {
                index,
                field: e.field,
                reason: e.reason,
            }
        })?;

        let step_id = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1));
        if !seen_ids.insert(step_id.clone()) {
            return Err(ValidationError::DuplicateStepId { index, step_id });
        }

        steps.push(ValidatedStep {
            index,
            step_id,
            capability: step.capability.clone(),
            args,
            entry: descriptor.entry(),
        });
    }

    debug!("Plan {} validated ({} steps)", plan.plan_id, steps.len());
    Ok(ValidatedPlan {
        plan_id: plan.plan_id.clone(),
        goal: plan.goal.clone(),
        steps,
    })
}
