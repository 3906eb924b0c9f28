use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub skills: SkillsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Real workspace the agent operates on. Created if missing.
    pub workspace: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Sovereign Agent".to_string(),
            workspace: PathBuf::from("./agent_workspace"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Where ephemeral workspace copies live. Must be outside the workspace.
    pub dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("sovereign-sandboxes"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SkillsConfig {
    /// Builtin skills to register
    pub enabled: Vec<String>,
    /// Directory scanned for `*.toml` command manifests
    pub manifest_dir: Option<PathBuf>,
    /// Upper bound for any single step
    pub step_timeout_secs: u64,
    pub shell: ShellConfig,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_skills(),
            manifest_dir: None,
            step_timeout_secs: 120,
            shell: ShellConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShellConfig {
    /// Default timeout for `run_command` when the step does not set one
    pub timeout_secs: u64,
    /// Extra regexes refused on top of the builtin list
    pub denied_patterns: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            denied_patterns: vec![],
        }
    }
}

fn default_enabled_skills() -> Vec<String> {
    ["write_file", "read_file", "list_dir", "delete_file", "run_command"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${HOME}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the default config file
    /// is absent. An explicitly requested file must exist.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.skills.step_timeout_secs == 0 {
            anyhow::bail!("[skills] step_timeout_secs must be at least 1");
        }
        if self.skills.shell.timeout_secs == 0 {
            anyhow::bail!("[skills.shell] timeout_secs must be at least 1");
        }
        Ok(())
    }
}
