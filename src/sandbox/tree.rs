//! Recursive copy and content digest of directory trees.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use super::paths::normalize_relative;
use super::RESERVED_DIR;
use crate::error::SandboxError;

/// Whether the top-level recorder directory takes part in a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reserved {
    Skip,
    Include,
}

fn is_reserved(entry: &DirEntry) -> bool {
    entry.depth() == 1 && entry.file_name() == RESERVED_DIR
}

fn walk(root: &Path, reserved: Reserved) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| reserved == Reserved::Include || !is_reserved(e))
}

fn walk_error(root: &Path, err: walkdir::Error) -> SandboxError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    SandboxError::Copy {
        path,
        source: io::Error::from(err),
    }
}

fn copy_error(path: &Path) -> impl FnOnce(io::Error) -> SandboxError + '_ {
    move |source| SandboxError::Copy {
        path: path.to_path_buf(),
        source,
    }
}

/// Copies `src` into the not-yet-existing directory `dst`.
///
/// Relative symlinks that stay inside `src` are recreated as symlinks; any
/// other symlink fails the copy. On error `dst` may hold a partial tree; the
/// caller owns its cleanup.
pub(crate) fn copy_tree(src: &Path, dst: &Path, reserved: Reserved) -> Result<(), SandboxError> {
    fs::create_dir(dst).map_err(copy_error(dst))?;

    for entry in walk(src, reserved) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = entry.path().strip_prefix(src).map_err(|_| SandboxError::Copy {
            path: entry.path().to_path_buf(),
            source: io::Error::other("entry outside of the source tree"),
        })?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(copy_error(entry.path()))?;
        } else if file_type.is_symlink() {
            copy_symlink(src, entry.path(), rel, &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(copy_error(entry.path()))?;
        }
    }
    Ok(())
}

fn copy_symlink(root: &Path, link: &Path, rel: &Path, target: &Path) -> Result<(), SandboxError> {
    let pointee = fs::read_link(link).map_err(copy_error(link))?;
    let escape = || SandboxError::SymlinkEscape {
        link: link.to_path_buf(),
        root: root.to_path_buf(),
    };

    if pointee.is_absolute() {
        return Err(escape());
    }
    let parent = rel.parent().unwrap_or_else(|| Path::new(""));
    if normalize_relative(&parent.join(&pointee)).is_none() {
        return Err(escape());
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&pointee, target).map_err(copy_error(link))
    }
    #[cfg(not(unix))]
    {
        fs::copy(link, target)
            .map(|_| ())
            .map_err(copy_error(link))
    }
}

/// SHA-256 over relative paths, entry kinds and file contents.
///
/// The recorder directory is left out so audit writes do not count as
/// workspace changes.
pub fn tree_digest(root: &Path) -> Result<String, SandboxError> {
    let mut hasher = Sha256::new();

    for entry in walk(root, Reserved::Skip) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let rel: PathBuf = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d");
        } else if file_type.is_symlink() {
            let pointee = fs::read_link(entry.path()).map_err(copy_error(entry.path()))?;
            hasher.update(b"l");
            hasher.update(pointee.to_string_lossy().as_bytes());
        } else {
            let content = fs::read(entry.path()).map_err(copy_error(entry.path()))?;
            hasher.update(b"f");
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
        hasher.update([0]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("README.md"), "hello").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(root.join("src/nested/data.bin"), [0u8, 1, 2, 3]).unwrap();
    }

    #[test]
    fn test_copy_tree_reproduces_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        populate(&src);

        copy_tree(&src, &dst, Reserved::Skip).unwrap();

        assert_eq!(fs::read_to_string(dst.join("README.md")).unwrap(), "hello");
        assert_eq!(
            fs::read(dst.join("src/nested/data.bin")).unwrap(),
            vec![0u8, 1, 2, 3]
        );
        assert_eq!(tree_digest(&src).unwrap(), tree_digest(&dst).unwrap());
    }

    #[test]
    fn test_copy_tree_skips_reserved_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join(".sovereign/flight")).unwrap();
        fs::write(src.join(".sovereign/flight/s.jsonl"), "{}").unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();

        let skipped = dir.path().join("skipped");
        copy_tree(&src, &skipped, Reserved::Skip).unwrap();
        assert!(!skipped.join(".sovereign").exists());
        assert!(skipped.join("a.txt").exists());

        let included = dir.path().join("included");
        copy_tree(&src, &included, Reserved::Include).unwrap();
        assert!(included.join(".sovereign/flight/s.jsonl").exists());
    }

    #[test]
    fn test_copy_tree_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        assert!(copy_tree(&src, &dst, Reserved::Skip).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_internal_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("docs")).unwrap();
        fs::write(src.join("target.txt"), "t").unwrap();
        std::os::unix::fs::symlink("../target.txt", src.join("docs/link.txt")).unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst, Reserved::Skip).unwrap();
        assert_eq!(
            fs::read_link(dst.join("docs/link.txt")).unwrap(),
            PathBuf::from("../target.txt")
        );
        assert_eq!(fs::read_to_string(dst.join("docs/link.txt")).unwrap(), "t");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_rejects_escaping_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        std::os::unix::fs::symlink("/etc/hostname", src.join("abs")).unwrap();

        let err = copy_tree(&src, &dir.path().join("dst"), Reserved::Skip).unwrap_err();
        assert!(matches!(err, SandboxError::SymlinkEscape { .. }));

        fs::remove_file(src.join("abs")).unwrap();
        std::os::unix::fs::symlink("../../outside", src.join("rel")).unwrap();
        let err = copy_tree(&src, &dir.path().join("dst2"), Reserved::Skip).unwrap_err();
        assert!(matches!(err, SandboxError::SymlinkEscape { .. }));
    }

    #[test]
    fn test_digest_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let before = tree_digest(dir.path()).unwrap();

        fs::write(dir.path().join("README.md"), "hello!").unwrap();
        assert_ne!(before, tree_digest(dir.path()).unwrap());
    }

    #[test]
    fn test_digest_ignores_recorder_dir() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let before = tree_digest(dir.path()).unwrap();

        fs::create_dir_all(dir.path().join(".sovereign/flight")).unwrap();
        fs::write(dir.path().join(".sovereign/flight/x.jsonl"), "{}\n").unwrap();
        assert_eq!(before, tree_digest(dir.path()).unwrap());
    }

    #[test]
    fn test_digest_distinguishes_empty_file_from_dir() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("x"), "").unwrap();
        fs::create_dir(b.path().join("x")).unwrap();
        assert_ne!(tree_digest(a.path()).unwrap(), tree_digest(b.path()).unwrap());
    }
}
