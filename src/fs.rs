//! File system abstraction used by the disk cache backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Abstraction over file system operations for testability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Reads a whole file.
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// Creates or truncates a file and writes `contents` to it.
    async fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()>;

    /// Renames a file, replacing the destination if it exists.
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Removes a directory and everything under it.
    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Lists the entries of a directory.
    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(path, contents).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }
}

/// Writes `contents` to `{path}.tmp` and renames it over `path`.
///
/// # Errors
///
/// Returns an error if either the write or the rename fails; the temporary
/// file is removed on a failed rename.
pub async fn write_atomic<F: FileSystem + ?Sized>(
    fs: &F,
    path: &Path,
    contents: &[u8],
) -> std::io::Result<()> {
    let tmp = tmp_path(path);
    fs.write(&tmp, contents).await?;
    if let Err(e) = fs.rename(&tmp, path).await {
        let _ = fs.remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Returns the `.tmp` staging path for a given final path.
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tokio_fs_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();

        let fs = TokioFileSystem::new();
        let err = fs.read(&dir.path().join("nonexistent.txt")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn tokio_fs_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");

        let fs = TokioFileSystem::new();
        fs.write(&path, b"hello").await.unwrap();
        assert_eq!(fs.read(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn tokio_fs_create_and_remove_dir_all() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");

        let fs = TokioFileSystem::new();
        fs.create_dir_all(&nested).await.unwrap();
        assert!(nested.exists());

        fs.remove_dir_all(&dir.path().join("a")).await.unwrap();
        assert!(!nested.exists());
    }

    #[tokio::test]
    async fn tokio_fs_read_dir_lists_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one"), b"1").unwrap();
        std::fs::write(dir.path().join("two"), b"2").unwrap();

        let fs = TokioFileSystem::new();
        let mut names: Vec<_> = fs
            .read_dir(dir.path())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let fs = TokioFileSystem::new();
        write_atomic(&fs, &path, b"{}").await.unwrap();
        write_atomic(&fs, &path, b"[]").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"[]");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn tmp_path_appends_extension() {
        assert_eq!(tmp_path(Path::new("a/b.json")), PathBuf::from("a/b.json.tmp"));
    }
}
