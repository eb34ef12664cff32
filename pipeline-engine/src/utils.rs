// Utility Functions
// Workspace detection and filesystem helpers shared by the cache and executor

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Find the root of a git checkout by walking up from `start`.
///
/// Returns `None` when no ancestor contains a `.git` entry.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Workspace a run operates on: the explicit directory if given, otherwise
/// the repository containing the current directory, otherwise the current
/// directory itself.
pub fn resolve_workspace(explicit: Option<&Path>) -> io::Result<PathBuf> {
    if let Some(dir) = explicit {
        return dir.canonicalize();
    }

    let cwd = std::env::current_dir()?;
    Ok(find_repo_root(&cwd).unwrap_or(cwd))
}

/// Copy a file or directory tree to `dst`, merging into existing directories.
///
/// Symlinks are recreated rather than followed on Unix. Returns the number of
/// bytes copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(src)?;

    if metadata.file_type().is_symlink() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return copy_symlink(src, dst);
    }

    if metadata.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(src, dst);
    }

    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copied += copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<u64> {
    let target = fs::read_link(src)?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(target, dst)?;
    Ok(0)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::copy(src, dst)
}

/// Remove a file or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_repo_root_from_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();

        let sub = root.join("a").join("b").join("c");
        fs::create_dir_all(&sub).unwrap();

        assert_eq!(
            find_repo_root(&sub).unwrap(),
            root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_nonexistent_path() {
        assert!(find_repo_root(Path::new("/nonexistent/path/that/does/not/exist")).is_none());
    }

    #[test]
    fn test_resolve_workspace_explicit() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_workspace(Some(temp.path())).unwrap(),
            temp.path().canonicalize().unwrap()
        );
        assert!(resolve_workspace(Some(Path::new("/nonexistent/ws"))).is_err());
    }

    #[test]
    fn test_copy_tree_merges_directories() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "aaa").unwrap();
        fs::write(src.join("nested/b.txt"), "bb").unwrap();

        let dst = temp.path().join("dst");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep.txt"), "k").unwrap();

        assert_eq!(copy_tree(&src, &dst).unwrap(), 5);
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "bb");
        assert!(dst.join("keep.txt").exists());
    }

    #[test]
    fn test_copy_single_file_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("file");
        fs::write(&src, "x").unwrap();

        let dst = temp.path().join("deep/er/file");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst).unwrap(), "x");
    }

    #[test]
    fn test_remove_path() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("d");
        fs::create_dir_all(dir.join("x")).unwrap();

        remove_path(&dir).unwrap();
        assert!(!dir.exists());
        remove_path(&dir).unwrap();
    }
}
