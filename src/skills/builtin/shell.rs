//! Builtin skill: run a shell command inside the sandbox.
//!
//! Commands run through `sh -c` with the sandbox root as working
//! directory. A small deny list refuses obviously destructive commands
//! before anything is spawned, and a command only counts as successful
//! when it exits 0 without printing a known error marker on stderr.

use std::time::Duration;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ShellConfig;
use crate::skills::command::{run_process, ProcessOutput};
use crate::skills::schema::{ArgSchema, FieldKind};
use crate::skills::{str_arg, Skill, SkillContext};

/// Commands matching any of these are refused.
const DANGEROUS_PATTERNS: &[&str] = &[
    r"(^|\s)rm\s+-rf",
    r"(^|\s)dd\s+",
    r"(^|\s)mkfs",
    r"(^|\s)chmod\s+\d{3}\s+/",
    r"(^|\s)shutdown\b",
    r"(^|\s)reboot\b",
];

/// Stderr markers that turn an exit code 0 into a failure.
const ERROR_INDICATORS: &[&str] = &[
    "error:",
    "invalid",
    "command not found",
    "usage:",
    "illegal option",
    "invalid option",
];

/// Hard ceiling for a per-step `timeout_secs` argument.
const MAX_TIMEOUT_SECS: u64 = 600;

/// Lines kept per stream in formatted output.
const MAX_OUTPUT_LINES: usize = 20;

/// Characters kept per line in formatted output.
const MAX_LINE_CHARS: usize = 120;

/// Builtin `run_command` skill.
pub struct ShellSkill {
    denied: Regex,
    default_timeout: Duration,
    max_timeout_secs: u64,
}

impl ShellSkill {
    pub fn new(config: &ShellConfig) -> anyhow::Result<Self> {
        let pattern = DANGEROUS_PATTERNS
            .iter()
            .copied()
            .chain(config.denied_patterns.iter().map(String::as_str))
            .map(|p| format!("(?:{p})"))
            .collect::<Vec<_>>()
            .join("|");
        let denied = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid [skills.shell] denied_patterns: {e}"))?;

        Ok(Self {
            denied,
            default_timeout: Duration::from_secs(config.timeout_secs),
            max_timeout_secs: MAX_TIMEOUT_SECS,
        })
    }

    /// Caps command timeouts at `secs`, the engine's step timeout. A longer
    /// command would be cut off by the engine anyway.
    pub fn with_max_timeout(mut self, secs: u64) -> Self {
        self.max_timeout_secs = secs.clamp(1, MAX_TIMEOUT_SECS);
        self.default_timeout = self
            .default_timeout
            .min(Duration::from_secs(self.max_timeout_secs));
        self
    }

    /// Why `command` must not run, if it must not.
    pub fn refusal(&self, command: &str) -> Option<String> {
        if command.trim().is_empty() {
            return Some("no command specified".to_string());
        }
        if self.denied.is_match(command) {
            return Some(format!("command appears dangerous or disallowed: {command}"));
        }
        None
    }
}

/// True when `stderr` contains one of the known error markers.
fn has_error_indicators(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ERROR_INDICATORS.iter().any(|marker| lower.contains(marker))
}

/// Drops ANSI color sequences and control characters, expands tabs.
fn clean_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' if chars.peek() == Some(&'[') => {
                chars.next();
                // Skip parameters up to the final byte
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            '\t' => out.push_str("    "),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

/// Keeps the first [`MAX_OUTPUT_LINES`] lines of a stream.
fn truncate_output(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let mut kept: Vec<String> = lines
        .iter()
        .take(MAX_OUTPUT_LINES)
        .map(|line| truncate_chars(&clean_line(line), MAX_LINE_CHARS))
        .collect();
    if lines.len() > MAX_OUTPUT_LINES {
        kept.push(format!("... ({} more lines)", lines.len() - MAX_OUTPUT_LINES));
    }
    kept.join("\n")
}

/// Plain-text rendering of a command result, used in step errors.
pub fn format_command_result(command: &str, output: &ProcessOutput) -> String {
    let shown = truncate_chars(&command.split_whitespace().collect::<Vec<_>>().join(" "), 80);
    let status = match output.exit_code {
        Some(0) => "success".to_string(),
        Some(code) => format!("failed (exit code: {code})"),
        None => "killed by signal".to_string(),
    };

    let mut parts = vec![format!("Command: {shown}"), format!("Status: {status}")];
    for (label, stream) in [("Output", &output.stdout), ("Error", &output.stderr)] {
        if stream.trim().is_empty() {
            continue;
        }
        let body = truncate_output(stream)
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("{label}:\n{body}"));
    }
    parts.join("\n\n")
}

#[async_trait]
impl Skill for ShellSkill {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command (sh -c) with the workspace as working directory. \
         Destructive commands are refused. A command fails when it exits non-zero \
         or reports an error on stderr."
    }

    fn schema(&self) -> ArgSchema {
        ArgSchema::new()
            .required(
                "command",
                FieldKind::String {
                    min_len: Some(1),
                    max_len: None,
                },
                "Shell command to execute",
            )
            .optional(
                "timeout_secs",
                FieldKind::integer(Some(1), Some(self.max_timeout_secs as i64)),
                &format!(
                    "Timeout in seconds (default: {}, at most {})",
                    self.default_timeout.as_secs(),
                    self.max_timeout_secs
                ),
            )
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process:sh".to_string()]
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        context: &SkillContext<'_>,
    ) -> anyhow::Result<Value> {
        let command = str_arg(&args, "command")?;
        if let Some(reason) = self.refusal(command) {
            warn!("Refused command in step {}: {command}", context.step_id);
            anyhow::bail!(reason);
        }

        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!("Step {}: sh -c {command:?}", context.step_id);
        let mut process = Command::new("sh");
        process.arg("-c").arg(command).current_dir(context.root());
        let output = run_process(process, Some(timeout)).await?;

        if !output.success() || has_error_indicators(&output.stderr) {
            anyhow::bail!(format_command_result(command, &output));
        }

        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": truncate_output(&output.stdout),
            "stderr": truncate_output(&output.stderr),
        }))
    }
}
