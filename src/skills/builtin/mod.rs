pub mod files;
pub mod shell;

use std::sync::Arc;

use tracing::warn;

use crate::config::SkillsConfig;
use crate::skills::Skill;

pub use files::{DeleteFileSkill, ListDirSkill, ReadFileSkill, WriteFileSkill};
pub use shell::ShellSkill;

/// Names of every compiled-in skill.
pub const BUILTIN_NAMES: &[&str] = &[
    "write_file",
    "read_file",
    "list_dir",
    "delete_file",
    "run_command",
];

/// Instantiates the builtin skills listed in `[skills] enabled`, in
/// catalog order. Unknown names are logged and ignored.
pub fn enabled(config: &SkillsConfig) -> anyhow::Result<Vec<Arc<dyn Skill>>> {
    for name in &config.enabled {
        if !BUILTIN_NAMES.contains(&name.as_str()) {
            warn!("Unknown builtin skill in [skills] enabled: {name}");
        }
    }

    let wanted = |name: &str| config.enabled.iter().any(|n| n == name);
    let mut skills: Vec<Arc<dyn Skill>> = Vec::new();
    if wanted("write_file") {
        skills.push(Arc::new(WriteFileSkill));
    }
    if wanted("read_file") {
        skills.push(Arc::new(ReadFileSkill));
    }
    if wanted("list_dir") {
        skills.push(Arc::new(ListDirSkill));
    }
    if wanted("delete_file") {
        skills.push(Arc::new(DeleteFileSkill));
    }
    if wanted("run_command") {
        skills.push(Arc::new(
            ShellSkill::new(&config.shell)?.with_max_timeout(config.step_timeout_secs),
        ));
    }
    Ok(skills)
}
