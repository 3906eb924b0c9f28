//! Logical path handling.
//!
//! Handlers and plans speak in workspace-relative paths. These helpers turn
//! them into normalized relative paths without touching the filesystem; the
//! sandbox handle then anchors the result under its physical root.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::RESERVED_DIR;

/// Why a logical path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathViolation {
    Absolute,
    Escape,
    Reserved,
}

impl fmt::Display for PathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "absolute paths are not allowed"),
            Self::Escape => write!(f, "path escapes the workspace"),
            Self::Reserved => write!(f, "path is reserved for the flight recorder"),
        }
    }
}

/// Lexically normalizes a relative path: drops `.`, resolves `..`.
///
/// Returns `None` for absolute paths or when `..` climbs above the start.
pub(crate) fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Turns a logical workspace path into a normalized relative path.
///
/// `""` and `"."` both denote the workspace root.
pub fn normalize_logical(logical: &str) -> Result<PathBuf, PathViolation> {
    let path = Path::new(logical);
    if path.has_root() || path.is_absolute() {
        return Err(PathViolation::Absolute);
    }
    let normalized = normalize_relative(path).ok_or(PathViolation::Escape)?;
    if normalized
        .components()
        .next()
        .is_some_and(|first| first.as_os_str() == RESERVED_DIR)
    {
        return Err(PathViolation::Reserved);
    }
    Ok(normalized)
}
