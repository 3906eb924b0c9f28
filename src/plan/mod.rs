//! Plans as produced by an external planner, and their validated form.

mod validate;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::skills::Skill;

pub use validate::validate;

fn new_plan_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One requested action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Planner-chosen identifier, unique within the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub capability: String,
    #[serde(default)]
    pub args: Value,
    /// What the planner meant this step to achieve (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl PlanStep {
    pub fn new(capability: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            capability: capability.into(),
            args,
            goal: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A plan as received from the planner. Untrusted until validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default = "new_plan_id")]
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub steps: Vec<PlanStep>,
}

impl TaskPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: new_plan_id(),
            goal: None,
            steps,
        }
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read plan {}: {e}", path.display()))?;
        Self::from_json(&text)
    }
}

/// A step that passed validation, bound to the skill that runs it.
pub struct ValidatedStep {
    index: usize,
    step_id: String,
    capability: String,
    args: Map<String, Value>,
    entry: Arc<dyn Skill>,
}

impl ValidatedStep {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Arguments after schema normalization.
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub(crate) fn entry(&self) -> &Arc<dyn Skill> {
        &self.entry
    }
}

impl fmt::Debug for ValidatedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedStep")
            .field("index", &self.index)
            .field("step_id", &self.step_id)
            .field("capability", &self.capability)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// A plan every step of which names a registered capability with
/// schema-conforming arguments. Only [`validate`] builds one.
#[derive(Debug)]
pub struct ValidatedPlan {
    plan_id: String,
    goal: Option<String>,
    steps: Vec<ValidatedStep>,
}

impl ValidatedPlan {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn goal(&self) -> Option<&str> {
        self.goal.as_deref()
    }

    pub fn steps(&self) -> &[ValidatedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_from_json() {
        let plan = TaskPlan::from_json(
            r#"{
                "plan_id": "p-1",
                "goal": "create notes",
                "steps": [
                    {"id": "write", "capability": "write_file", "args": {"path": "a.txt", "content": "hi"}},
                    {"capability": "list_dir"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(plan.plan_id, "p-1");
        assert_eq!(plan.goal.as_deref(), Some("create notes"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].id.as_deref(), Some("write"));
        assert_eq!(plan.steps[0].args["path"], "a.txt");
        assert_eq!(plan.steps[1].args, Value::Null);
    }

    #[test]
    fn test_plan_id_defaults_to_uuid() {
        let plan = TaskPlan::from_json(r#"{"steps": []}"#).unwrap();
        assert!(uuid::Uuid::parse_str(&plan.plan_id).is_ok());
    }

    #[test]
    fn test_plan_requires_capability() {
        assert!(TaskPlan::from_json(r#"{"steps": [{"args": {}}]}"#).is_err());
    }

    #[test]
    fn test_plan_serialization_skips_empty_fields() {
        let plan = TaskPlan::new(vec![PlanStep::new("list_dir", json!({})).with_id("ls")]);
        let value = serde_json::to_value(&plan).unwrap();
        assert!(value.get("goal").is_none());
        assert_eq!(value["steps"][0]["id"], "ls");
        assert!(value["steps"][0].get("goal").is_none());
    }

    #[test]
    fn test_plan_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"steps": [{"capability": "list_dir"}]}"#).unwrap();
        assert_eq!(TaskPlan::load(&path).unwrap().steps.len(), 1);
        assert!(TaskPlan::load(&dir.path().join("missing.json")).is_err());
    }
}
