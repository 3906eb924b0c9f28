//! Flight recorder: the append-only audit trail of a session.
//!
//! Layout:
//!   {workspace}/.sovereign/flight/{session_id}.jsonl   (one entry per line)
//!
//! Entries are kept in memory and written through to the session file as
//! they are appended. A failed write never fails the operation being
//! recorded: it is logged at `error!`, kept as the recorder's failure, and
//! the entry stays queued until the next successful write or `flush()`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::RecorderError;
use crate::sandbox::RESERVED_DIR;

/// Sub-directory of the reserved workspace directory holding session logs.
const FLIGHT_DIR: &str = "flight";

/// A significant event in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlightEvent {
    PlanReceived {
        steps: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        goal: Option<String>,
    },
    PlanRejected {
        reason: String,
    },
    SandboxCreated {
        sandbox_id: Uuid,
        root: PathBuf,
    },
    StepStarted {
        index: usize,
        capability: String,
    },
    StepSucceeded {
        index: usize,
        duration_ms: u64,
    },
    StepFailed {
        index: usize,
        error: String,
        duration_ms: u64,
    },
    SandboxReconciled {
        sandbox_id: Uuid,
    },
    ReconcileFailed {
        sandbox_id: Uuid,
        reason: String,
    },
    SandboxDiscarded {
        sandbox_id: Uuid,
    },
    PlanCompleted {
        steps: usize,
    },
    PlanAborted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
        reason: String,
    },
}

impl FlightEvent {
    /// The `kind` tag as written to the log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanReceived { .. } => "plan_received",
            Self::PlanRejected { .. } => "plan_rejected",
            Self::SandboxCreated { .. } => "sandbox_created",
            Self::StepStarted { .. } => "step_started",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::SandboxReconciled { .. } => "sandbox_reconciled",
            Self::ReconcileFailed { .. } => "reconcile_failed",
            Self::SandboxDiscarded { .. } => "sandbox_discarded",
            Self::PlanCompleted { .. } => "plan_completed",
            Self::PlanAborted { .. } => "plan_aborted",
        }
    }
}

/// One line of a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(flatten)]
    pub event: FlightEvent,
}

/// Identifiers attached to an event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
    pub plan_id: Option<&'a str>,
    pub step_id: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn session() -> Self {
        Self::default()
    }

    pub fn plan(plan_id: &'a str) -> Self {
        Self {
            plan_id: Some(plan_id),
            step_id: None,
        }
    }

    pub fn step(plan_id: &'a str, step_id: &'a str) -> Self {
        Self {
            plan_id: Some(plan_id),
            step_id: Some(step_id),
        }
    }
}

/// Append-only event log for one session.
pub struct FlightRecorder {
    session_id: Uuid,
    path: PathBuf,
    entries: Vec<FlightEntry>,
    /// Trailing entries not yet written to disk.
    unpersisted: usize,
    failure: Option<RecorderError>,
}

impl FlightRecorder {
    /// Starts a new session recording into `workspace`.
    ///
    /// Nothing touches the disk until the first append.
    pub fn open(workspace: &Path) -> Self {
        Self::with_session(workspace, Uuid::new_v4())
    }

    pub fn with_session(workspace: &Path, session_id: Uuid) -> Self {
        Self {
            session_id,
            path: session_path(workspace, session_id),
            entries: Vec::new(),
            unpersisted: 0,
            failure: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry appended so far, in order.
    pub fn entries(&self) -> &[FlightEntry] {
        &self.entries
    }

    /// The most recent durable-write failure, if it has not been cleared by
    /// a successful `flush()`.
    pub fn failure(&self) -> Option<&RecorderError> {
        self.failure.as_ref()
    }

    /// Records an event. Never fails; see the module docs.
    pub fn append(&mut self, scope: Scope<'_>, event: FlightEvent) {
        let entry = FlightEntry {
            seq: self.entries.len() as u64,
            ts: Utc::now(),
            session_id: self.session_id,
            plan_id: scope.plan_id.map(str::to_string),
            step_id: scope.step_id.map(str::to_string),
            event,
        };
        debug!(
            "Flight record {}#{}: {}",
            self.session_id,
            entry.seq,
            entry.event.kind()
        );
        self.entries.push(entry);
        self.unpersisted += 1;

        if let Err(e) = self.persist_pending() {
            error!("AUDIT WRITE FAILED: {e}");
            self.failure = Some(e);
        }
    }

    /// Writes every queued entry and syncs the session file.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        self.persist_pending()?;
        if self.path.exists() {
            let file = OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(|source| self.write_error(source))?;
            file.sync_all().map_err(|source| self.write_error(source))?;
        }
        self.failure = None;
        Ok(())
    }

    fn write_error(&self, source: std::io::Error) -> RecorderError {
        RecorderError::Write {
            session_id: self.session_id,
            source,
        }
    }

    fn persist_pending(&mut self) -> Result<(), RecorderError> {
        if self.unpersisted == 0 {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.write_error(source))?;
        self.write_pending(&mut file)
    }

    /// Writes the queued entries as one batch. A failed batch leaves the
    /// file as it was, so the retry never lands after a torn line.
    fn write_pending(&mut self, file: &mut impl LogFile) -> Result<(), RecorderError> {
        let start = self.entries.len() - self.unpersisted;
        let mut batch = Vec::new();
        for entry in &self.entries[start..] {
            serde_json::to_writer(&mut batch, entry)?;
            batch.push(b'\n');
        }
        append_batch(file, &batch).map_err(|source| self.write_error(source))?;
        self.unpersisted = 0;
        Ok(())
    }

    /// Directory holding every session file of a workspace.
    pub fn log_dir(workspace: &Path) -> PathBuf {
        workspace.join(RESERVED_DIR).join(FLIGHT_DIR)
    }

    /// Reads back a session, in append order.
    pub fn load(workspace: &Path, session_id: Uuid) -> Result<Vec<FlightEntry>, RecorderError> {
        let path = session_path(workspace, session_id);
        let content = fs::read_to_string(&path).map_err(|source| RecorderError::Read {
            path: path.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let corrupt = |reason: String| RecorderError::Corrupt {
                path: path.clone(),
                line: i + 1,
                reason,
            };
            let entry: FlightEntry =
                serde_json::from_str(line).map_err(|e| corrupt(e.to_string()))?;
            if entry.session_id != session_id {
                return Err(corrupt(format!(
                    "entry belongs to session {}",
                    entry.session_id
                )));
            }
            let expected = entries.len() as u64;
            if entry.seq != expected {
                return Err(corrupt(format!(
                    "expected seq {expected}, found {}",
                    entry.seq
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Session ids with a log file in `workspace`, sorted.
    pub fn list_sessions(workspace: &Path) -> Result<Vec<Uuid>, RecorderError> {
        let dir = Self::log_dir(workspace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let read_err = |source| RecorderError::Read {
            path: dir.clone(),
            source,
        };
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                sessions.push(id);
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

/// The session file as the recorder writes it.
trait LogFile: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Appends `batch` whole, or truncates back to the previous length.
fn append_batch(file: &mut impl LogFile, batch: &[u8]) -> io::Result<()> {
    let len = file.len()?;
    if let Err(e) = file.write_all(batch).and_then(|()| file.flush()) {
        if let Err(undo) = file.truncate(len) {
            error!("Could not drop partial flight record write: {undo}");
        }
        return Err(e);
    }
    Ok(())
}

fn session_path(workspace: &Path, session_id: Uuid) -> PathBuf {
    FlightRecorder::log_dir(workspace).join(format!("{session_id}.jsonl"))
}
