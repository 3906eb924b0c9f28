//! Builtin file skills: write, read, list and delete inside the sandbox.
//!
//! Every path argument is resolved through the sandbox handle carried by
//! the [`SkillContext`]; none of these skills can reach the real workspace.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::skills::schema::{ArgSchema, FieldKind};
use crate::skills::{str_arg, Skill, SkillContext};

/// Largest file `read_file` returns (1 MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

// ── write_file ──────────────────────────────────────────

/// Creates or overwrites a file, creating parent directories as needed.
pub struct WriteFileSkill;

#[async_trait]
impl Skill for WriteFileSkill {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace. Parent directories are created \
         as needed. Use 'append' mode to add to an existing file."
    }

    fn schema(&self) -> ArgSchema {
        ArgSchema::new()
            .required("path", FieldKind::Path, "Workspace-relative file path")
            .required("content", FieldKind::string(), "Full file content")
            .optional(
                "mode",
                FieldKind::Enum {
                    values: vec!["overwrite".to_string(), "append".to_string()],
                },
                "Write mode (default: overwrite)",
            )
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sandbox:write".to_string()]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        let logical = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        let append = args.get("mode").and_then(Value::as_str) == Some("append");

        let path = context.resolve(logical)?;
        if path.is_dir() {
            anyhow::bail!("{logical} is a directory");
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&path, content).await?;
        }

        debug!("Wrote {} bytes to {logical}", content.len());
        Ok(json!({ "path": logical, "bytes_written": content.len() }))
    }
}

// ── read_file ───────────────────────────────────────────

/// Returns the UTF-8 content of a file.
pub struct ReadFileSkill;

#[async_trait]
impl Skill for ReadFileSkill {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Files larger than 1 MB are refused."
    }

    fn schema(&self) -> ArgSchema {
        ArgSchema::new().required("path", FieldKind::Path, "Workspace-relative file path")
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sandbox:read".to_string()]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        let logical = str_arg(&args, "path")?;
        let path = context.resolve(logical)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read {logical}: {e}"))?;
        if !metadata.is_file() {
            anyhow::bail!("{logical} is not a file");
        }
        if metadata.len() > MAX_READ_SIZE {
            anyhow::bail!(
                "{logical} is too large ({} bytes, limit is {MAX_READ_SIZE} bytes)",
                metadata.len()
            );
        }

        let bytes = tokio::fs::read(&path).await?;
        let content = String::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("{logical} is not valid UTF-8"))?;
        Ok(json!({ "path": logical, "content": content }))
    }
}

// ── list_dir ────────────────────────────────────────────

/// Lists the entries of a directory, sorted by name.
pub struct ListDirSkill;

#[async_trait]
impl Skill for ListDirSkill {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory (default: the workspace root). \
         Directories are suffixed with '/'."
    }

    fn schema(&self) -> ArgSchema {
        ArgSchema::new().optional("path", FieldKind::Path, "Directory to list")
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sandbox:read".to_string()]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        let logical = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = context.resolve(logical)?;

        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot list {logical}: {e}"))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // The recorder directory is not part of the workspace contents
            if name == crate::sandbox::RESERVED_DIR && path == context.root() {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(name);
            }
        }
        entries.sort();

        Ok(json!({ "path": logical, "entries": entries }))
    }
}

// ── delete_file ─────────────────────────────────────────

/// Deletes a file, or a directory when `recursive` is set.
pub struct DeleteFileSkill;

#[async_trait]
impl Skill for DeleteFileSkill {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file from the workspace. Set 'recursive' to delete a directory \
         and everything in it."
    }

    fn schema(&self) -> ArgSchema {
        ArgSchema::new()
            .required("path", FieldKind::Path, "Workspace-relative path")
            .optional("recursive", FieldKind::Boolean, "Delete directories (default: false)")
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sandbox:write".to_string()]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        let logical = str_arg(&args, "path")?;
        let recursive = args
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let path = context.resolve(logical)?;
        if path == context.root() {
            anyhow::bail!("refusing to delete the workspace root");
        }

        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot delete {logical}: {e}"))?;
        if metadata.is_dir() {
            if !recursive {
                anyhow::bail!("{logical} is a directory (set recursive to delete it)");
            }
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }

        debug!("Deleted {logical}");
        Ok(json!({ "path": logical, "deleted": true }))
    }
}
