pub mod builtin;
pub mod command;
pub mod registry;
pub mod schema;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::SandboxHandle;

/// Runtime context passed to skill execution.
///
/// Skills never see the real workspace: every path goes through the
/// sandbox handle the context borrows.
pub struct SkillContext<'a> {
    /// Session the step belongs to (for log correlation).
    pub session_id: Uuid,
    /// Identifier of the step being executed.
    pub step_id: &'a str,
    sandbox: &'a SandboxHandle,
}

impl<'a> SkillContext<'a> {
    pub fn new(session_id: Uuid, step_id: &'a str, sandbox: &'a SandboxHandle) -> Self {
        Self {
            session_id,
            step_id,
            sandbox,
        }
    }

    /// Physical root of the sandbox, used as working directory for
    /// child processes.
    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    /// Resolves a workspace-relative path inside the sandbox.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf, SandboxError> {
        self.sandbox.resolve(logical)
    }
}

/// A capability that plans can invoke.
///
/// All handlers (builtin or manifest-declared) implement this trait. The
/// engine calls `execute()` with arguments already validated against
/// `schema()`.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier used in plans.
    /// Must be lowercase alphanumeric + underscores (e.g. "write_file").
    fn name(&self) -> &str;

    /// Human-readable description shown to planners.
    fn description(&self) -> &str;

    /// Declared arguments.
    fn schema(&self) -> schema::ArgSchema;

    /// Declared capabilities (informational).
    /// Examples: "filesystem:sandbox:write", "process:sh"
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Executes the skill and returns its output payload.
    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value>;
}

/// Fetches a string argument already checked by the schema.
pub(crate) fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> anyhow::Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {name}"))
}

pub use registry::{CapabilityDescriptor, SkillOrigin, SkillRegistry};
pub use schema::{ArgSchema, FieldKind, FieldSpec};
