//! File-system helpers shared by the task runners and the evaluator.

pub mod archive;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};

/// Remove a directory tree, treating a missing directory as success.
pub async fn ensure_removed_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            tracing::error!("{}: {}", path.display(), e);
            Err(e)
        }
    }
}

/// Copy a directory tree recursively.
pub fn copy_dir_all<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, std::io::Result<()>> {
    async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir_all(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Join `relative` onto `base`, rejecting absolute paths and any `..`
/// component so the result cannot escape `base`.
pub fn resolve_inside(base: &Path, relative: &str) -> std::io::Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("absolute path not allowed: {relative}"),
        ));
    }
    for component in rel.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path escapes the working directory: {relative}"),
            ));
        }
    }
    Ok(base.join(rel))
}

/// Read at most `limit` bytes from the start of a file; missing files
/// yield an empty string.
pub async fn read_prefix(path: &Path, limit: usize) -> String {
    use tokio::io::AsyncReadExt;
    let Ok(file) = tokio::fs::File::open(path).await else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    let mut handle = file.take(limit as u64);
    if handle.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn ensure_removed_dir_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("sub");
        tokio::fs::create_dir_all(victim.join("nested")).await.unwrap();
        tokio::fs::write(victim.join("nested/file"), b"x").await.unwrap();

        ensure_removed_dir(&victim).await.unwrap();
        assert!(!victim.exists());
        ensure_removed_dir(&victim).await.unwrap();
    }

    #[tokio::test]
    async fn copy_dir_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        tokio::fs::create_dir_all(src.join("a/b")).await.unwrap();
        tokio::fs::write(src.join("top.txt"), b"top").await.unwrap();
        tokio::fs::write(src.join("a/b/deep.txt"), b"deep").await.unwrap();

        let dst = dir.path().join("dst");
        copy_dir_all(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(dst.join("top.txt")).await.unwrap(), b"top");
        assert_eq!(
            tokio::fs::read(dst.join("a/b/deep.txt")).await.unwrap(),
            b"deep"
        );
    }

    #[test]
    fn resolve_inside_rejects_escapes() {
        let base = Path::new("/work");
        assert_eq!(resolve_inside(base, "a/b").unwrap(), Path::new("/work/a/b"));
        assert!(resolve_inside(base, "../etc/passwd").is_err());
        assert!(resolve_inside(base, "a/../../b").is_err());
        assert!(resolve_inside(base, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn read_prefix_bounds_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.txt");
        tokio::fs::write(&file, b"hello world").await.unwrap();
        assert_eq!(read_prefix(&file, 5).await, "hello");
        assert_eq!(read_prefix(&file, 100).await, "hello world");
        assert_eq!(read_prefix(&dir.path().join("missing"), 5).await, "");
    }
}
