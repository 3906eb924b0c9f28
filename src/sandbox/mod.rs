//! Execution sandbox: ephemeral copies of the workspace.
//!
//! Every plan runs against a full copy of the workspace, never the
//! workspace itself:
//!
//! 1. `create` copies the workspace into `<sandbox dir>/<uuid>.partial`
//!    and commits it by renaming to `<sandbox dir>/<uuid>`
//! 2. skills resolve every path through [`SandboxHandle::resolve`]
//! 3. `reconcile` stages the sandbox next to the workspace and swaps the
//!    two directories by rename, so the workspace is either fully replaced
//!    or untouched
//! 4. `discard` deletes the copy (idempotent)
//!
//! The `.sovereign/` directory at the workspace root belongs to the flight
//! recorder. It is never copied into a sandbox and always survives a
//! reconcile.

mod paths;
mod tree;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;

pub use paths::{normalize_logical, PathViolation};
pub use tree::tree_digest;
use tree::{copy_tree, Reserved};

/// Workspace-root directory owned by the flight recorder.
pub const RESERVED_DIR: &str = ".sovereign";

/// Lifecycle of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Active,
    Reconciled,
    Discarded,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Reconciled => write!(f, "reconciled"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

/// An isolated copy of a workspace.
///
/// Issued and mutated only by [`SandboxManager`]; the execution engine
/// borrows it for the duration of a plan.
#[derive(Debug)]
pub struct SandboxHandle {
    id: Uuid,
    root: PathBuf,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    digest: String,
    state: SandboxState,
}

impl SandboxHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Physical root of the copy (canonical).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The workspace this sandbox was copied from (canonical).
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Content digest of the workspace at copy time.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    fn ensure_active(&self) -> Result<(), SandboxError> {
        if self.state == SandboxState::Active {
            Ok(())
        } else {
            Err(SandboxError::NotActive {
                id: self.id,
                state: self.state,
            })
        }
    }

    /// Translates a logical workspace path into a physical path inside the
    /// sandbox.
    ///
    /// Beyond the lexical checks, the deepest existing ancestor of the
    /// result must canonicalize inside the sandbox root, which catches
    /// symlinks created by earlier steps. Dangling symlinks are refused.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf, SandboxError> {
        self.ensure_active()?;

        let rel = normalize_logical(logical).map_err(|violation| SandboxError::Path {
            path: logical.to_string(),
            violation,
        })?;
        let candidate = self.root.join(rel);
        let escape = || SandboxError::Path {
            path: logical.to_string(),
            violation: PathViolation::Escape,
        };

        let mut ancestor = candidate.clone();
        loop {
            match fs::canonicalize(&ancestor) {
                Ok(real) => {
                    if !real.starts_with(&self.root) {
                        return Err(escape());
                    }
                    break;
                }
                Err(_) => {
                    if fs::symlink_metadata(&ancestor).is_ok() {
                        return Err(escape());
                    }
                    if !ancestor.pop() {
                        break;
                    }
                }
            }
        }

        Ok(candidate)
    }
}

/// Creates, reconciles and discards sandboxes under one base directory.
pub struct SandboxManager {
    base_dir: PathBuf,
}

impl SandboxManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Copies `workspace` into a fresh sandbox.
    ///
    /// The copy is built under a `.partial` name and only renamed into place
    /// once complete; on any failure the partial copy is removed.
    pub fn create(&self, workspace: &Path) -> Result<SandboxHandle, SandboxError> {
        let workspace = canonical_workspace(workspace)?;

        fs::create_dir_all(&self.base_dir).map_err(|source| SandboxError::Copy {
            path: self.base_dir.clone(),
            source,
        })?;
        let base = fs::canonicalize(&self.base_dir).map_err(|source| SandboxError::Copy {
            path: self.base_dir.clone(),
            source,
        })?;
        if base.starts_with(&workspace) {
            return Err(SandboxError::InvalidLocation {
                base,
                workspace,
            });
        }

        let id = Uuid::new_v4();
        let staging = base.join(format!("{id}.partial"));
        let root = base.join(id.to_string());

        let committed = copy_tree(&workspace, &staging, Reserved::Skip).and_then(|()| {
            fs::rename(&staging, &root).map_err(|source| SandboxError::Copy {
                path: root.clone(),
                source,
            })
        });
        if let Err(e) = committed {
            warn!("Sandbox {id}: copy of {} failed: {e}", workspace.display());
            remove_quietly(&staging);
            return Err(e);
        }

        let digest = match tree_digest(&root) {
            Ok(digest) => digest,
            Err(e) => {
                remove_quietly(&root);
                return Err(e);
            }
        };

        info!(
            "Sandbox {id} created at {} from {}",
            root.display(),
            workspace.display()
        );

        Ok(SandboxHandle {
            id,
            root,
            workspace,
            created_at: Utc::now(),
            digest,
            state: SandboxState::Active,
        })
    }

    /// Copies the sandbox's state back over the real workspace.
    ///
    /// All-or-nothing: the sandbox is staged in full next to the workspace
    /// (same filesystem) before the two directories are swapped by rename.
    /// Refuses when the workspace changed since `create`.
    pub fn reconcile(
        &self,
        handle: &mut SandboxHandle,
        workspace: &Path,
    ) -> Result<(), SandboxError> {
        handle.ensure_active()?;
        let workspace = canonical_workspace(workspace)?;
        if workspace != handle.workspace {
            return Err(SandboxError::WrongWorkspace {
                id: handle.id,
                expected: handle.workspace.clone(),
                actual: workspace,
            });
        }
        if tree_digest(&workspace)? != handle.digest {
            return Err(SandboxError::WorkspaceDiverged {
                id: handle.id,
                path: workspace,
            });
        }

        let id = handle.id;
        let reconcile_err = |source| SandboxError::Reconcile { id, source };
        let parent = workspace
            .parent()
            .ok_or_else(|| reconcile_err(std::io::Error::other("workspace has no parent")))?;
        let name = workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        let staging = parent.join(format!(".{name}.reconcile-{id}"));
        let backup = parent.join(format!(".{name}.backup-{id}"));

        let staged = copy_tree(&handle.root, &staging, Reserved::Skip)
            .and_then(|()| carry_reserved(&workspace, &staging));
        if let Err(e) = staged {
            warn!("Sandbox {id}: staging for reconcile failed: {e}");
            remove_quietly(&staging);
            return Err(e);
        }

        if let Err(source) = fs::rename(&workspace, &backup) {
            remove_quietly(&staging);
            return Err(reconcile_err(source));
        }
        if let Err(source) = fs::rename(&staging, &workspace) {
            if let Err(rollback) = fs::rename(&backup, &workspace) {
                error!(
                    "Sandbox {id}: rollback failed ({rollback}); original workspace is at {}",
                    backup.display()
                );
            }
            remove_quietly(&staging);
            return Err(reconcile_err(source));
        }
        if let Err(e) = fs::remove_dir_all(&backup) {
            warn!(
                "Sandbox {id}: reconciled, but could not remove backup {}: {e}",
                backup.display()
            );
        }

        handle.state = SandboxState::Reconciled;
        info!("Sandbox {id} reconciled into {}", workspace.display());
        Ok(())
    }

    /// Removes the sandbox copy. Safe to call on an already-discarded handle.
    ///
    /// A reconciled handle keeps its state; only its copy is removed.
    pub fn discard(&self, handle: &mut SandboxHandle) -> Result<(), SandboxError> {
        if handle.state == SandboxState::Discarded {
            debug!("Sandbox {} already discarded", handle.id);
            return Ok(());
        }

        match fs::remove_dir_all(&handle.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SandboxError::Discard {
                    id: handle.id,
                    source,
                })
            }
        }

        if handle.state == SandboxState::Active {
            handle.state = SandboxState::Discarded;
            info!("Sandbox {} discarded", handle.id);
        } else {
            debug!("Sandbox {} copy removed after reconcile", handle.id);
        }
        Ok(())
    }
}

fn canonical_workspace(workspace: &Path) -> Result<PathBuf, SandboxError> {
    let canonical = fs::canonicalize(workspace).map_err(|source| SandboxError::SourceUnreadable {
        path: workspace.to_path_buf(),
        source,
    })?;
    if !canonical.is_dir() {
        return Err(SandboxError::SourceUnreadable {
            path: workspace.to_path_buf(),
            source: std::io::Error::other("not a directory"),
        });
    }
    Ok(canonical)
}

/// Copies the recorder directory of the live workspace into a staged tree.
fn carry_reserved(workspace: &Path, staging: &Path) -> Result<(), SandboxError> {
    let reserved = workspace.join(RESERVED_DIR);
    if !reserved.exists() {
        return Ok(());
    }
    copy_tree(&reserved, &staging.join(RESERVED_DIR), Reserved::Include)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!("Could not clean up {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        manager: SandboxManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        fs::create_dir_all(workspace.join("src")).unwrap();
        fs::write(workspace.join("README.md"), "readme").unwrap();
        fs::write(workspace.join("src/main.rs"), "fn main() {}").unwrap();
        let manager = SandboxManager::new(dir.path().join("sandboxes"));
        Fixture {
            _dir: dir,
            workspace,
            manager,
        }
    }

    #[test]
    fn test_create_copies_workspace() {
        let fx = fixture();
        let handle = fx.manager.create(&fx.workspace).unwrap();

        assert_eq!(handle.state(), SandboxState::Active);
        assert_ne!(handle.root(), fx.workspace.as_path());
        assert_eq!(
            fs::read_to_string(handle.root().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert_eq!(handle.digest(), tree_digest(&fx.workspace).unwrap());
        // No partial copy left behind
        let leftovers: Vec<_> = fs::read_dir(fx.manager.base_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_create_gives_unique_roots() {
        let fx = fixture();
        let a = fx.manager.create(&fx.workspace).unwrap();
        let b = fx.manager.create(&fx.workspace).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_create_missing_workspace_fails() {
        let fx = fixture();
        let err = fx
            .manager
            .create(&fx.workspace.join("does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::SourceUnreadable { .. }));
    }

    #[test]
    fn test_create_refuses_base_inside_workspace() {
        let fx = fixture();
        let manager = SandboxManager::new(fx.workspace.join("tmp"));
        let err = manager.create(&fx.workspace).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidLocation { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_failure_leaves_no_partial_copy() {
        let fx = fixture();
        std::os::unix::fs::symlink("/etc/hostname", fx.workspace.join("escape")).unwrap();

        let err = fx.manager.create(&fx.workspace).unwrap_err();
        assert!(matches!(err, SandboxError::SymlinkEscape { .. }));
        let entries = fs::read_dir(fx.manager.base_dir()).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_sandbox_isolation() {
        let fx = fixture();
        let before = tree_digest(&fx.workspace).unwrap();
        let handle = fx.manager.create(&fx.workspace).unwrap();

        fs::write(handle.resolve("README.md").unwrap(), "changed").unwrap();
        fs::write(handle.resolve("new.txt").unwrap(), "new").unwrap();
        fs::remove_file(handle.resolve("src/main.rs").unwrap()).unwrap();

        assert_eq!(tree_digest(&fx.workspace).unwrap(), before);
        assert_eq!(
            fs::read_to_string(fx.workspace.join("README.md")).unwrap(),
            "readme"
        );
        assert!(!fx.workspace.join("new.txt").exists());
    }

    #[test]
    fn test_resolve_stays_inside_root() {
        let fx = fixture();
        let handle = fx.manager.create(&fx.workspace).unwrap();

        let path = handle.resolve("src/../README.md").unwrap();
        assert_eq!(path, handle.root().join("README.md"));
        assert_eq!(handle.resolve(".").unwrap(), handle.root());

        for bad in ["../escape", "/etc/passwd", ".sovereign/flight"] {
            assert!(
                matches!(handle.resolve(bad), Err(SandboxError::Path { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_planted_in_sandbox() {
        let fx = fixture();
        let handle = fx.manager.create(&fx.workspace).unwrap();
        std::os::unix::fs::symlink("/etc", handle.root().join("etc")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", handle.root().join("dangling"))
            .unwrap();

        assert!(handle.resolve("etc/hostname").is_err());
        assert!(handle.resolve("dangling").is_err());
    }

    #[test]
    fn test_reconcile_applies_sandbox_state() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();

        fs::write(handle.resolve("a.txt").unwrap(), "hi").unwrap();
        fs::remove_file(handle.resolve("README.md").unwrap()).unwrap();
        let expected = tree_digest(handle.root()).unwrap();

        fx.manager.reconcile(&mut handle, &fx.workspace).unwrap();

        assert_eq!(handle.state(), SandboxState::Reconciled);
        assert_eq!(fs::read_to_string(fx.workspace.join("a.txt")).unwrap(), "hi");
        assert!(!fx.workspace.join("README.md").exists());
        assert_eq!(tree_digest(&fx.workspace).unwrap(), expected);

        // Staging and backup directories are gone
        let parent = fx.workspace.parent().unwrap();
        let stray: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".workspace."))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn test_reconcile_preserves_recorder_dir() {
        let fx = fixture();
        let log_dir = fx.workspace.join(".sovereign/flight");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("session.jsonl"), "{\"seq\":0}\n").unwrap();

        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        assert!(!handle.root().join(".sovereign").exists());

        fx.manager.reconcile(&mut handle, &fx.workspace).unwrap();
        assert_eq!(
            fs::read_to_string(log_dir.join("session.jsonl")).unwrap(),
            "{\"seq\":0}\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_reconcile_failure_leaves_workspace_untouched() {
        let fx = fixture();
        let before = tree_digest(&fx.workspace).unwrap();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();

        // Valid changes first, then an entry that cannot be staged
        fs::write(handle.resolve("a.txt").unwrap(), "hi").unwrap();
        fs::write(handle.resolve("README.md").unwrap(), "overwritten").unwrap();
        std::os::unix::fs::symlink("/etc/hostname", handle.root().join("zz-link")).unwrap();

        let err = fx.manager.reconcile(&mut handle, &fx.workspace).unwrap_err();
        assert!(matches!(err, SandboxError::SymlinkEscape { .. }));

        assert_eq!(tree_digest(&fx.workspace).unwrap(), before);
        assert_eq!(handle.state(), SandboxState::Active);
        let parent = fx.workspace.parent().unwrap();
        assert!(!parent
            .join(format!(".workspace.reconcile-{}", handle.id()))
            .exists());
    }

    #[test]
    fn test_reconcile_refuses_diverged_workspace() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        fs::write(handle.resolve("a.txt").unwrap(), "from sandbox").unwrap();

        fs::write(fx.workspace.join("README.md"), "edited by the user").unwrap();

        let err = fx.manager.reconcile(&mut handle, &fx.workspace).unwrap_err();
        assert!(matches!(err, SandboxError::WorkspaceDiverged { .. }));
        assert_eq!(
            fs::read_to_string(fx.workspace.join("README.md")).unwrap(),
            "edited by the user"
        );
        assert!(!fx.workspace.join("a.txt").exists());
    }

    #[test]
    fn test_reconcile_requires_active_handle() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        fx.manager.discard(&mut handle).unwrap();

        let err = fx.manager.reconcile(&mut handle, &fx.workspace).unwrap_err();
        assert!(matches!(err, SandboxError::NotActive { .. }));
    }

    #[test]
    fn test_reconcile_rejects_other_workspace() {
        let fx = fixture();
        let other = fx.workspace.parent().unwrap().join("other");
        fs::create_dir(&other).unwrap();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();

        let err = fx.manager.reconcile(&mut handle, &other).unwrap_err();
        assert!(matches!(err, SandboxError::WrongWorkspace { .. }));
    }

    #[test]
    fn test_discard_is_idempotent() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        let root = handle.root().to_path_buf();

        fx.manager.discard(&mut handle).unwrap();
        assert!(!root.exists());
        assert_eq!(handle.state(), SandboxState::Discarded);

        fx.manager.discard(&mut handle).unwrap();
        assert_eq!(handle.state(), SandboxState::Discarded);
    }

    #[test]
    fn test_discard_after_reconcile_removes_copy() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        fx.manager.reconcile(&mut handle, &fx.workspace).unwrap();
        let root = handle.root().to_path_buf();

        fx.manager.discard(&mut handle).unwrap();
        assert!(!root.exists());
        assert!(fx.workspace.join("README.md").exists());
        assert_eq!(handle.state(), SandboxState::Reconciled);
    }

    #[test]
    fn test_resolve_on_discarded_handle_fails() {
        let fx = fixture();
        let mut handle = fx.manager.create(&fx.workspace).unwrap();
        fx.manager.discard(&mut handle).unwrap();
        assert!(matches!(
            handle.resolve("a.txt"),
            Err(SandboxError::NotActive { .. })
        ));
    }
}
