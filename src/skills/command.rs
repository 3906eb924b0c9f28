//! Declarative command skills.
//!
//! A manifest is a TOML file describing an external program and the
//! arguments it accepts:
//!
//! ```toml
//! name = "grep_text"
//! description = "Search files for a pattern"
//! program = "grep"
//! args = ["-rn", "{pattern}", "{path}"]
//! timeout_secs = 20
//!
//! [params.pattern]
//! type = "string"
//! required = true
//!
//! [params.path]
//! type = "path"
//! required = true
//! ```
//!
//! The program runs with the sandbox root as its working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::debug;

use super::schema::{ArgSchema, FieldSpec};
use crate::error::SandboxError;
use super::{Skill, SkillContext};

/// Environment variable carrying the full validated argument map as JSON.
pub const ARGS_ENV: &str = "SOVEREIGN_ARGS";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    name: Option<String>,
    description: Option<String>,
    program: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    allow_extra: bool,
    #[serde(default)]
    params: BTreeMap<String, FieldSpec>,
}

fn required(field: Option<String>, name: &str) -> Result<String, String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(format!("missing required field '{name}'")),
    }
}

// ── Templates ───────────────────────────────────────────

/// One piece of an argv template entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Param(String),
}

/// Splits `"--file={path}"` into literal and placeholder pieces.
/// `{{` and `}}` are literal braces.
fn parse_template(template: &str) -> Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(format!("unclosed placeholder in '{template}'")),
                    }
                }
                if name.is_empty() {
                    return Err(format!("empty placeholder in '{template}'"));
                }
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(Piece::Param(name));
            }
            '}' => return Err(format!("unmatched '}}' in '{template}'")),
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    Ok(pieces)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expands one template entry into zero or more argv items.
///
/// An entry made of a single placeholder expands to nothing when the
/// argument is absent, and to one item per element for arrays.
fn expand(pieces: &[Piece], args: &Map<String, Value>) -> Vec<String> {
    if let [Piece::Param(name)] = pieces {
        return match args.get(name) {
            None => vec![],
            Some(Value::Array(items)) => items.iter().map(scalar_text).collect(),
            Some(value) => vec![scalar_text(value)],
        };
    }

    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Param(name) => match args.get(name) {
                Some(Value::Array(items)) => {
                    out.push_str(&items.iter().map(scalar_text).collect::<Vec<_>>().join(","))
                }
                Some(value) => out.push_str(&scalar_text(value)),
                None => {}
            },
        }
    }
    vec![out]
}

// ── Process execution ───────────────────────────────────

/// Captured result of a child process.
#[derive(Debug, Clone)]
pub(crate) struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "exit_code": self.exit_code,
            "stdout": self.stdout,
            "stderr": self.stderr,
        })
    }
}

/// Runs `command` to completion, killing it when `timeout` elapses.
pub(crate) async fn run_process(
    mut command: Command,
    timeout: Option<Duration>,
) -> anyhow::Result<ProcessOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn()?;
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => anyhow::bail!("command timed out after {}s", limit.as_secs()),
        },
        None => child.wait_with_output().await?,
    };

    Ok(ProcessOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ── Skill ───────────────────────────────────────────────

/// A skill backed by an external program declared in a manifest.
#[derive(Debug)]
pub struct CommandSkill {
    name: String,
    description: String,
    program: PathBuf,
    template: Vec<Vec<Piece>>,
    timeout: Option<Duration>,
    schema: ArgSchema,
}

impl CommandSkill {
    /// Parses and checks a manifest file. The error is a human-readable
    /// rejection reason.
    pub fn from_manifest(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("cannot read manifest: {e}"))?;
        let manifest: Manifest =
            toml::from_str(&content).map_err(|e| format!("invalid manifest: {e}"))?;

        let name = required(manifest.name, "name")?;
        let description = required(manifest.description, "description")?;
        let program = required(manifest.program, "program")?;

        // Relative program paths are relative to the manifest
        let program = if program.contains('/') && Path::new(&program).is_relative() {
            path.parent()
                .map(|dir| dir.join(&program))
                .unwrap_or_else(|| PathBuf::from(&program))
        } else {
            PathBuf::from(program)
        };

        let mut template = Vec::with_capacity(manifest.args.len());
        for entry in &manifest.args {
            let pieces = parse_template(entry)?;
            for piece in &pieces {
                if let Piece::Param(param) = piece {
                    if !manifest.params.contains_key(param) {
                        return Err(format!(
                            "template placeholder '{{{param}}}' is not declared in params"
                        ));
                    }
                }
            }
            template.push(pieces);
        }

        if manifest.timeout_secs == Some(0) {
            return Err("timeout_secs must be at least 1".to_string());
        }

        Ok(Self {
            name,
            description,
            program,
            template,
            timeout: manifest.timeout_secs.map(Duration::from_secs),
            schema: ArgSchema::from_parts(manifest.params, manifest.allow_extra),
        })
    }

    /// Resolves every path argument through the sandbox before the program
    /// sees it. Symlinks planted by earlier steps are caught here.
    fn check_paths(
        &self,
        args: &Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> Result<(), SandboxError> {
        for (name, spec) in self.schema.fields() {
            if let Some(value) = args.get(name) {
                for path in spec.kind.paths(value) {
                    context.resolve(path)?;
                }
            }
        }
        Ok(())
    }

    /// Argument vector for a validated argument map.
    pub fn argv(&self, args: &Map<String, Value>) -> Vec<String> {
        self.template
            .iter()
            .flat_map(|pieces| expand(pieces, args))
            .collect()
    }
}

#[async_trait]
impl Skill for CommandSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> ArgSchema {
        self.schema.clone()
    }

    fn capabilities(&self) -> Vec<String> {
        vec![format!("process:{}", self.program.display())]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        self.check_paths(&args, context)?;
        let argv = self.argv(&args);
        debug!(
            "Step {}: running {} {:?}",
            context.step_id,
            self.program.display(),
            argv
        );

        let mut command = Command::new(&self.program);
        command
            .args(&argv)
            .current_dir(context.root())
            .env(ARGS_ENV, Value::Object(args).to_string());

        // Without a manifest timeout the engine's step timeout applies
        let output = run_process(command, self.timeout).await?;

        if !output.success() {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            anyhow::bail!(
                "{} exited with {code}: {}",
                self.name,
                output.stderr.trim()
            );
        }
        Ok(output.to_json())
    }
}
