//! Capability registry.
//!
//! Built once at startup from two sources:
//! - the compiled-in builtin skills enabled by configuration
//! - `*.toml` command manifests found under the handler directory
//!
//! Every candidate is checked before the registry exists; rejections are
//! collected rather than stopping at the first one. The registry is never
//! mutated afterwards; a rescan builds a new one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::command::CommandSkill;
use super::schema::ArgSchema;
use super::Skill;
use crate::error::{RegistryError, Rejection};

/// Where a capability was discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillOrigin {
    Builtin,
    Manifest(PathBuf),
}

impl SkillOrigin {
    fn label(&self, name: &str) -> String {
        match self {
            Self::Builtin => format!("builtin:{name}"),
            Self::Manifest(path) => path.display().to_string(),
        }
    }
}

/// A registered capability. Immutable once registered.
pub struct CapabilityDescriptor {
    name: String,
    description: String,
    schema: ArgSchema,
    origin: SkillOrigin,
    entry: Arc<dyn Skill>,
}

impl CapabilityDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &ArgSchema {
        &self.schema
    }

    pub fn origin(&self) -> &SkillOrigin {
        &self.origin
    }

    /// Resources the skill declares it touches.
    pub fn capabilities(&self) -> Vec<String> {
        self.entry.capabilities()
    }

    /// Opaque handle to the code performing the action.
    pub fn entry(&self) -> Arc<dyn Skill> {
        Arc::clone(&self.entry)
    }
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Name → capability map.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, CapabilityDescriptor>,
}

impl SkillRegistry {
    /// Builds a registry from `builtins` plus every manifest under
    /// `manifest_dir`.
    ///
    /// A missing manifest directory only means there are no manifests.
    pub fn discover(
        manifest_dir: Option<&Path>,
        builtins: Vec<Arc<dyn Skill>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        let mut rejected = Vec::new();

        for skill in builtins {
            registry.admit(skill, SkillOrigin::Builtin, &mut rejected);
        }

        if let Some(dir) = manifest_dir {
            for path in manifest_paths(dir)? {
                match CommandSkill::from_manifest(&path) {
                    Ok(skill) => {
                        registry.admit(Arc::new(skill), SkillOrigin::Manifest(path), &mut rejected)
                    }
                    Err(reason) => rejected.push(Rejection {
                        origin: path.display().to_string(),
                        reason,
                    }),
                }
            }
        }

        if !rejected.is_empty() {
            for r in &rejected {
                warn!("Rejected capability {r}");
            }
            return Err(RegistryError::Rejected { rejected });
        }

        info!(
            "Capabilities: {} registered ({})",
            registry.len(),
            registry.names().collect::<Vec<_>>().join(", ")
        );
        Ok(registry)
    }

    fn admit(&mut self, skill: Arc<dyn Skill>, origin: SkillOrigin, rejected: &mut Vec<Rejection>) {
        let name = skill.name().to_string();
        let reject = |reason: String| Rejection {
            origin: origin.label(&name),
            reason,
        };

        if !valid_name(&name) {
            rejected.push(reject(format!(
                "invalid capability name '{name}' (lowercase alphanumeric and underscores only)"
            )));
            return;
        }
        if skill.description().trim().is_empty() {
            rejected.push(reject("missing required field 'description'".to_string()));
            return;
        }
        let schema = skill.schema();
        if let Err(e) = schema.check() {
            rejected.push(reject(format!("malformed argument schema: {e}")));
            return;
        }
        if let Some(existing) = self.skills.get(&name) {
            rejected.push(reject(format!(
                "duplicate capability name '{name}' (already declared by {})",
                existing.origin.label(&name)
            )));
            return;
        }

        debug!("Registered capability {name} from {}", origin.label(&name));
        self.skills.insert(
            name.clone(),
            CapabilityDescriptor {
                name,
                description: skill.description().to_string(),
                schema,
                origin,
                entry: skill,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.skills.get(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.skills.values()
    }
}

/// Every `*.toml` file under `dir`, sorted. Hidden entries are skipped.
fn manifest_paths(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    if !dir.exists() {
        debug!("Handler directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(|e| RegistryError::Unreadable {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e.into(),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("toml")
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::schema::FieldKind;
    use crate::skills::SkillContext;
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct FakeSkill {
        name: &'static str,
        description: &'static str,
        schema: ArgSchema,
    }

    impl FakeSkill {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                description: "does things",
                schema: ArgSchema::new().required("path", FieldKind::Path, ""),
            }
        }
    }

    #[async_trait]
    impl Skill for FakeSkill {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            self.description
        }

        fn schema(&self) -> ArgSchema {
            self.schema.clone()
        }

        async fn execute(
            &self,
            _args: Map<String, Value>,
            _context: &SkillContext<'_>,
        ) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    const GREP_MANIFEST: &str = r#"
name = "grep_text"
description = "Search files for a pattern"
program = "grep"
args = ["-rn", "{pattern}", "{path}"]

[params.pattern]
type = "string"
required = true

[params.path]
type = "path"
required = true
"#;

    #[test]
    fn test_discover_builtins_only() {
        let registry = SkillRegistry::discover(
            None,
            vec![Arc::new(FakeSkill::named("alpha")), Arc::new(FakeSkill::named("beta"))],
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        let alpha = registry.get("alpha").unwrap();
        assert_eq!(alpha.origin(), &SkillOrigin::Builtin);
        assert!(alpha.schema().get("path").unwrap().required);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            SkillRegistry::discover(Some(&dir.path().join("nope")), vec![]).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discover_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "grep.toml", GREP_MANIFEST);
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write(
            &dir.path().join("nested"),
            "echo.toml",
            "name = \"echo_text\"\ndescription = \"Echo\"\nprogram = \"echo\"\nargs = [\"{text}\"]\n[params.text]\ntype = \"string\"\nrequired = true\n",
        );
        write(dir.path(), "README.md", "not a manifest");
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        write(&dir.path().join(".hidden"), "bad.toml", "garbage = ");

        let registry =
            SkillRegistry::discover(Some(dir.path()), vec![Arc::new(FakeSkill::named("alpha"))])
                .unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["alpha", "echo_text", "grep_text"]
        );
        assert!(matches!(
            registry.get("grep_text").unwrap().origin(),
            SkillOrigin::Manifest(p) if p.ends_with("grep.toml")
        ));
    }

    #[test]
    fn test_discover_accumulates_all_rejections() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a_grep.toml", GREP_MANIFEST);
        write(dir.path(), "b_dup.toml", GREP_MANIFEST);
        write(dir.path(), "c_noname.toml", "description = \"x\"\nprogram = \"true\"\n");
        write(
            dir.path(),
            "d_badschema.toml",
            "name = \"bad_schema\"\ndescription = \"x\"\nprogram = \"true\"\n[params.mode]\ntype = \"enum\"\nvalues = []\n",
        );
        write(dir.path(), "e_syntax.toml", "name = ");

        let err = SkillRegistry::discover(
            Some(dir.path()),
            vec![Arc::new(FakeSkill::named("alpha")), Arc::new(FakeSkill::named("alpha"))],
        )
        .unwrap_err();

        let RegistryError::Rejected { rejected } = err else {
            panic!("expected rejections");
        };
        assert_eq!(rejected.len(), 5);
        assert_eq!(rejected[0].origin, "builtin:alpha");
        assert!(rejected[0].reason.contains("duplicate capability name 'alpha'"));
        assert!(rejected[1].origin.ends_with("b_dup.toml"));
        assert!(rejected[1].reason.contains("duplicate capability name 'grep_text'"));
        assert!(rejected[2].reason.contains("missing required field 'name'"));
        assert!(rejected[3].reason.contains("malformed argument schema"));
        assert!(rejected[4].reason.contains("invalid manifest"));
    }

    #[test]
    fn test_rejects_invalid_names_and_descriptions() {
        let badly_named = FakeSkill::named("Bad-Name");
        let mut silent = FakeSkill::named("silent");
        silent.description = "  ";

        let err =
            SkillRegistry::discover(None, vec![Arc::new(badly_named), Arc::new(silent)]).unwrap_err();
        let RegistryError::Rejected { rejected } = err else {
            panic!("expected rejections");
        };
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].reason.contains("invalid capability name"));
        assert!(rejected[1].reason.contains("description"));
    }

    #[test]
    fn test_rescan_is_independent() {
        let dir = tempfile::tempdir().unwrap();
        let first = SkillRegistry::discover(Some(dir.path()), vec![]).unwrap();
        assert!(first.is_empty());

        write(dir.path(), "grep.toml", GREP_MANIFEST);
        let second = SkillRegistry::discover(Some(dir.path()), vec![]).unwrap();
        assert_eq!(second.len(), 1);
        assert!(first.is_empty());
    }
}
