use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RecorderError, SessionError};
use crate::plan::{validate, TaskPlan};
use crate::recorder::{FlightEntry, FlightEvent, FlightRecorder, Scope};
use crate::sandbox::{SandboxHandle, SandboxManager, SandboxState};
use crate::skills::{builtin, SkillRegistry};

use super::engine::{CancelToken, ExecutionEngine, ExecutionReport};

/// The agent runtime: registry, sandbox manager and engine for one
/// workspace.
///
/// Built once at startup. Plans are run through a [`Session`].
pub struct AgentRuntime {
    config: Config,
    registry: SkillRegistry,
    sandboxes: SandboxManager,
    engine: ExecutionEngine,
    workspace: PathBuf,
}

impl AgentRuntime {
    /// Discovers capabilities from configuration and prepares the workspace.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let builtins = builtin::enabled(&config.skills)?;
        let registry = SkillRegistry::discover(config.skills.manifest_dir.as_deref(), builtins)?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: Config, registry: SkillRegistry) -> anyhow::Result<Self> {
        let workspace = config.agent.workspace.clone();
        if !workspace.exists() {
            info!("Creating workspace {}", workspace.display());
            std::fs::create_dir_all(&workspace)?;
        }

        Ok(Self {
            sandboxes: SandboxManager::new(config.sandbox.dir.clone()),
            engine: ExecutionEngine::new(Duration::from_secs(config.skills.step_timeout_secs)),
            registry,
            workspace,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Starts a new session with its own flight record.
    pub fn open_session(&self) -> Session<'_> {
        let recorder = FlightRecorder::open(&self.workspace);
        info!(
            "Session {} opened (flight record: {})",
            recorder.session_id(),
            recorder.path().display()
        );
        Session {
            runtime: self,
            recorder,
            sandbox: None,
            last_plan: None,
            cancel: CancelToken::new(),
            closed: false,
        }
    }

    /// Sessions recorded in this workspace.
    pub fn sessions(&self) -> Result<Vec<Uuid>, RecorderError> {
        FlightRecorder::list_sessions(&self.workspace)
    }

    /// Reads back a recorded session.
    pub fn load_session(&self, session_id: Uuid) -> Result<Vec<FlightEntry>, RecorderError> {
        FlightRecorder::load(&self.workspace, session_id)
    }
}

/// One interaction: plans run here, and their sandbox waits for an
/// explicit reconcile or discard.
///
/// Dropping a session discards any pending sandbox and flushes the
/// recorder; use [`Session::close`] to observe audit failures.
pub struct Session<'a> {
    runtime: &'a AgentRuntime,
    recorder: FlightRecorder,
    sandbox: Option<SandboxHandle>,
    /// Plan id of the last run, and whether it completed.
    last_plan: Option<(String, bool)>,
    cancel: CancelToken,
    closed: bool,
}

impl<'a> Session<'a> {
    pub fn id(&self) -> Uuid {
        self.recorder.session_id()
    }

    /// Token that cancels the running plan between steps.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The sandbox of the last run, if one is held.
    pub fn sandbox(&self) -> Option<&SandboxHandle> {
        self.sandbox.as_ref()
    }

    /// Flight record of this session so far.
    pub fn events(&self) -> &[FlightEntry] {
        self.recorder.entries()
    }

    /// The most recent audit write failure, if any.
    pub fn audit_failure(&self) -> Option<&RecorderError> {
        self.recorder.failure()
    }

    /// Validates `plan`, copies the workspace and executes the plan in the
    /// copy.
    ///
    /// The sandbox is kept for [`reconcile`](Self::reconcile) or
    /// [`discard`](Self::discard); a new plan cannot start until that
    /// happens.
    pub async fn run(&mut self, plan: &TaskPlan) -> Result<ExecutionReport, SessionError> {
        if let Some(pending) = &self.sandbox {
            if pending.state() == SandboxState::Active {
                return Err(SessionError::SandboxPending(pending.id()));
            }
        }
        self.sandbox = None;
        self.last_plan = None;

        let plan_id = plan.plan_id.as_str();
        info!("Session {}: received plan {plan_id}", self.id());
        self.recorder.append(
            Scope::plan(plan_id),
            FlightEvent::PlanReceived {
                steps: plan.steps.len(),
                goal: plan.goal.clone(),
            },
        );

        let validated = match validate(self.runtime.registry(), plan) {
            Ok(validated) => validated,
            Err(e) => {
                warn!("Plan {plan_id} rejected: {e}");
                self.recorder.append(
                    Scope::plan(plan_id),
                    FlightEvent::PlanRejected {
                        reason: e.to_string(),
                    },
                );
                return Err(e.into());
            }
        };

        let sandbox = match self.runtime.sandboxes.create(&self.runtime.workspace) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!("Plan {plan_id}: cannot create sandbox: {e}");
                self.recorder.append(
                    Scope::plan(plan_id),
                    FlightEvent::PlanAborted {
                        step_index: None,
                        reason: e.to_string(),
                    },
                );
                return Err(e.into());
            }
        };
        self.recorder.append(
            Scope::plan(plan_id),
            FlightEvent::SandboxCreated {
                sandbox_id: sandbox.id(),
                root: sandbox.root().to_path_buf(),
            },
        );

        self.cancel.reset();
        let report = self
            .runtime
            .engine
            .execute(&validated, &sandbox, &mut self.recorder, &self.cancel)
            .await;

        self.sandbox = Some(sandbox);
        self.last_plan = Some((plan_id.to_string(), report.is_completed()));
        Ok(report)
    }

    /// Commits the sandbox of a completed plan to the real workspace.
    pub fn reconcile(&mut self) -> Result<(), SessionError> {
        let (plan_id, completed) = self.last_plan.clone().ok_or(SessionError::NoSandbox)?;
        if !completed {
            return Err(SessionError::NotCompleted { plan_id });
        }
        self.commit()
    }

    /// Commits the sandbox even though the plan aborted.
    pub fn reconcile_partial(&mut self) -> Result<(), SessionError> {
        warn!("Session {}: committing a partial result", self.id());
        self.commit()
    }

    fn commit(&mut self) -> Result<(), SessionError> {
        let sandbox = self.sandbox.as_mut().ok_or(SessionError::NoSandbox)?;
        let plan_id = self.last_plan.as_ref().map(|(id, _)| id.clone());
        let scope = match &plan_id {
            Some(id) => Scope::plan(id),
            None => Scope::session(),
        };

        if let Err(e) = self
            .runtime
            .sandboxes
            .reconcile(sandbox, &self.runtime.workspace)
        {
            warn!("Sandbox {}: reconcile refused: {e}", sandbox.id());
            self.recorder.append(
                scope,
                FlightEvent::ReconcileFailed {
                    sandbox_id: sandbox.id(),
                    reason: e.to_string(),
                },
            );
            return Err(e.into());
        }
        self.recorder.append(
            scope,
            FlightEvent::SandboxReconciled {
                sandbox_id: sandbox.id(),
            },
        );

        // The copy has served its purpose
        if let Err(e) = self.runtime.sandboxes.discard(sandbox) {
            warn!("Sandbox {}: {e}", sandbox.id());
        }
        Ok(())
    }

    /// Throws the sandbox away. The real workspace is untouched.
    pub fn discard(&mut self) -> Result<(), SessionError> {
        let sandbox = self.sandbox.as_mut().ok_or(SessionError::NoSandbox)?;
        if sandbox.state() != SandboxState::Active {
            return Ok(());
        }
        let plan_id = self.last_plan.as_ref().map(|(id, _)| id.clone());
        let scope = match &plan_id {
            Some(id) => Scope::plan(id),
            None => Scope::session(),
        };

        self.runtime.sandboxes.discard(sandbox)?;
        self.recorder.append(
            scope,
            FlightEvent::SandboxDiscarded {
                sandbox_id: sandbox.id(),
            },
        );
        Ok(())
    }

    /// Ends the session: discards a pending sandbox and flushes the flight
    /// record. The returned error reports audit failures only.
    pub fn close(mut self) -> Result<(), RecorderError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), RecorderError> {
        self.closed = true;
        if self
            .sandbox
            .as_ref()
            .is_some_and(|s| s.state() == SandboxState::Active)
        {
            if let Err(e) = self.discard() {
                error!("Session {}: could not discard sandbox: {e}", self.id());
            }
        }
        let flushed = self.recorder.flush();
        info!("Session {} closed", self.id());
        flushed
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.finish() {
            error!("AUDIT WRITE FAILED on session drop: {e}");
        }
    }
}
