//! Sandbox lifecycle: copy-on-start isolation and conservative merge.
//!
//! A sandbox is a full copy of the root workspace under a uniquely named
//! sibling directory, exclusively owned by one milestone execution. Merge is
//! copy-if-absent and two-phase: every conflicting path is detected before a
//! single byte is copied, so a conflicted merge leaves the root completely
//! untouched. Callers serialize merges (and sandbox creation) behind the
//! scheduler's merge lock; this module assumes that exclusion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

/// Errors produced while merging a sandbox into the root workspace.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// A sandbox file's relative path already exists in the root. The merge
    /// refuses to guess between concurrent edits; nothing was copied.
    #[error("merge conflict on {path}: file already exists in root workspace")]
    Conflict { path: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for merge operations.
pub type MergeResult<T> = std::result::Result<T, MergeError>;

/// Copy the root workspace into a uniquely named sibling directory
/// (`<node-id>-<6 hex>`), so repeated runs of the same node never collide
/// and concurrent tasks never observe each other's uncommitted writes.
pub fn create_sandbox(root: &Path, node_id: &str) -> io::Result<PathBuf> {
    let suffix = Uuid::new_v4().simple().to_string();
    let parent = root.parent().unwrap_or_else(|| Path::new("."));
    let sandbox = parent.join(format!("{node_id}-{}", &suffix[..6]));

    fs::create_dir_all(&sandbox)?;
    if root.exists() {
        copy_tree(root, &sandbox)?;
    }
    debug!(sandbox = %sandbox.display(), node_id, "sandbox created");
    Ok(sandbox)
}

/// Merge `sandbox` into `root` with copy-if-absent semantics.
///
/// Phase one walks the sandbox and collects every relative file path; any
/// path that already exists in the root aborts with [`MergeError::Conflict`]
/// before anything is copied. Phase two copies the files in, creating parent
/// directories as needed. Returns the merged relative paths.
pub fn merge_sandbox(sandbox: &Path, root: &Path) -> MergeResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(sandbox, Path::new(""), &mut files)?;

    for rel in &files {
        if root.join(rel).exists() {
            return Err(MergeError::Conflict { path: rel.clone() });
        }
    }

    for rel in &files {
        let dst = root.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(sandbox.join(rel), &dst)?;
    }
    debug!(sandbox = %sandbox.display(), merged = files.len(), "sandbox merged");
    Ok(files)
}

/// Delete a sandbox directory after a successful merge.
pub fn remove_sandbox(sandbox: &Path) -> io::Result<()> {
    fs::remove_dir_all(sandbox)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn collect_files(base: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(base.join(rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(base, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_sandbox_is_a_full_copy_with_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        write(&root.join("src/lib.rs"), "pub fn f() {}");

        let a = create_sandbox(&root, "m1").unwrap();
        let b = create_sandbox(&root, "m1").unwrap();
        assert_ne!(a, b);
        assert_eq!(
            fs::read_to_string(a.join("src/lib.rs")).unwrap(),
            "pub fn f() {}"
        );
    }

    #[test]
    fn test_sandbox_writes_are_invisible_to_root_and_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        fs::create_dir_all(&root).unwrap();

        let a = create_sandbox(&root, "m1").unwrap();
        let b = create_sandbox(&root, "m2").unwrap();
        write(&a.join("a.txt"), "from a");

        assert!(!root.join("a.txt").exists());
        assert!(!b.join("a.txt").exists());
    }

    #[test]
    fn test_merge_copies_new_files_with_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        fs::create_dir_all(&root).unwrap();

        let sandbox = create_sandbox(&root, "m1").unwrap();
        write(&sandbox.join("out/result.txt"), "done");
        write(&sandbox.join("top.txt"), "top");

        let merged = merge_sandbox(&sandbox, &root).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(fs::read_to_string(root.join("out/result.txt")).unwrap(), "done");
        assert_eq!(fs::read_to_string(root.join("top.txt")).unwrap(), "top");
    }

    #[test]
    fn test_merge_conflict_leaves_root_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        write(&root.join("shared.txt"), "original");

        let sandbox = create_sandbox(&root, "m1").unwrap();
        write(&sandbox.join("shared.txt"), "rewritten");

        let err = merge_sandbox(&sandbox, &root).unwrap_err();
        match err {
            MergeError::Conflict { path } => assert_eq!(path, PathBuf::from("shared.txt")),
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(root.join("shared.txt")).unwrap(), "original");
    }

    #[test]
    fn test_conflicted_merge_copies_nothing_at_all() {
        // Even non-conflicting files stay out when any path conflicts.
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        write(&root.join("shared.txt"), "original");

        let sandbox = create_sandbox(&root, "m1").unwrap();
        write(&sandbox.join("shared.txt"), "rewritten");
        write(&sandbox.join("brand_new.txt"), "new");

        assert!(merge_sandbox(&sandbox, &root).is_err());
        assert!(!root.join("brand_new.txt").exists());
    }

    #[test]
    fn test_remove_sandbox_deletes_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        fs::create_dir_all(&root).unwrap();

        let sandbox = create_sandbox(&root, "m1").unwrap();
        write(&sandbox.join("deep/file.txt"), "x");
        remove_sandbox(&sandbox).unwrap();
        assert!(!sandbox.exists());
    }
}
