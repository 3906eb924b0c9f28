//! Error taxonomy for the agent core.
//!
//! Registry and validation errors describe bad input (a malformed handler,
//! a bad plan) and are always returned to the caller. Sandbox and recorder
//! errors describe a failure of the runtime itself. `SessionError` keeps the
//! two apart so a front end can tell "your plan was bad" from "the system
//! failed".

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::sandbox::{PathViolation, SandboxState};

/// A capability candidate rejected during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Where the candidate came from (`builtin:<name>` or a manifest path).
    pub origin: String,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.reason)
    }
}

fn list_rejections(rejected: &[Rejection]) -> String {
    rejected
        .iter()
        .map(|r| format!("  - {r}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors produced while building a capability registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// One or more candidates were rejected. Every rejection is listed.
    #[error("{} capability candidate(s) rejected:\n{}", .rejected.len(), list_rejections(.rejected))]
    Rejected { rejected: Vec<Rejection> },

    /// The handler directory exists but cannot be scanned.
    #[error("cannot scan handler directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A plan rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("plan {plan_id} has no steps")]
    EmptyPlan { plan_id: String },

    #[error("step {index}: unknown capability '{name}'")]
    UnknownCapability { index: usize, name: String },

    #[error("step {index}: invalid argument '{field}': {reason}")]
    InvalidArgument {
        index: usize,
        field: String,
        reason: String,
    },

    #[error("step {index}: duplicate step id '{step_id}'")]
    DuplicateStepId { index: usize, step_id: String },
}

impl ValidationError {
    /// Index of the offending step, if the error is tied to one.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::EmptyPlan { .. } => None,
            Self::UnknownCapability { index, .. }
            | Self::InvalidArgument { index, .. }
            | Self::DuplicateStepId { index, .. } => Some(*index),
        }
    }
}

/// Failures of the sandbox manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("workspace {path} is not readable: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sandbox directory {base} must not be inside workspace {workspace}")]
    InvalidLocation { base: PathBuf, workspace: PathBuf },

    #[error("copy failed at {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("symlink {link} points outside of {root}")]
    SymlinkEscape { link: PathBuf, root: PathBuf },

    #[error("path '{path}' rejected: {violation}")]
    Path {
        path: String,
        violation: PathViolation,
    },

    #[error("sandbox {id} is {state}, expected active")]
    NotActive { id: Uuid, state: SandboxState },

    #[error("sandbox {id} was created from {expected}, not {actual}")]
    WrongWorkspace {
        id: Uuid,
        expected: PathBuf,
        actual: PathBuf,
    },

    #[error("workspace {path} changed since sandbox {id} was created; refusing to overwrite")]
    WorkspaceDiverged { id: Uuid, path: PathBuf },

    #[error("reconcile of sandbox {id} failed, workspace left untouched: {source}")]
    Reconcile {
        id: Uuid,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove sandbox {id}: {source}")]
    Discard {
        id: Uuid,
        #[source]
        source: io::Error,
    },
}

/// Why a single step failed at runtime.
#[derive(Debug, Error)]
pub enum StepExecutionError {
    #[error("{0:#}")]
    Skill(anyhow::Error),

    #[error("step timed out after {0}s")]
    Timeout(u64),
}

/// Durable-write failures of the flight recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("flight record write failed for session {session_id}: {source}")]
    Write {
        session_id: Uuid,
        #[source]
        source: io::Error,
    },

    #[error("cannot read flight record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("flight record {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("flight record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by a [`Session`](crate::agent::runtime::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("plan rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("no sandbox is held by this session")]
    NoSandbox,

    #[error("sandbox {0} from the previous plan must be reconciled or discarded first")]
    SandboxPending(Uuid),

    #[error("plan {plan_id} did not complete; only an explicit partial reconcile may commit it")]
    NotCompleted { plan_id: String },
}

impl SessionError {
    /// True when the caller's plan was at fault, false when the system failed.
    pub fn is_plan_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_lists_every_rejection() {
        let err = RegistryError::Rejected {
            rejected: vec![
                Rejection {
                    origin: "handlers/a.toml".to_string(),
                    reason: "missing required field 'name'".to_string(),
                },
                Rejection {
                    origin: "handlers/b.toml".to_string(),
                    reason: "duplicate capability name 'grep'".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 capability candidate(s) rejected"));
        assert!(text.contains("handlers/a.toml: missing required field 'name'"));
        assert!(text.contains("handlers/b.toml: duplicate capability name 'grep'"));
    }

    #[test]
    fn test_validation_error_step_index() {
        let err = ValidationError::UnknownCapability {
            index: 2,
            name: "nope".to_string(),
        };
        assert_eq!(err.step_index(), Some(2));
        assert_eq!(err.to_string(), "step 2: unknown capability 'nope'");

        let err = ValidationError::EmptyPlan {
            plan_id: "p".to_string(),
        };
        assert_eq!(err.step_index(), None);
    }

    #[test]
    fn test_session_error_distinguishes_plan_from_system() {
        let plan_err: SessionError = ValidationError::EmptyPlan {
            plan_id: "p".to_string(),
        }
        .into();
        assert!(plan_err.is_plan_error());

        let system_err: SessionError = SandboxError::Discard {
            id: Uuid::new_v4(),
            source: io::Error::other("busy"),
        }
        .into();
        assert!(!system_err.is_plan_error());
    }
}
