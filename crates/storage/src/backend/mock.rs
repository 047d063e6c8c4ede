//! In-memory storage backend for testing.

use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory storage backend for testing.
///
/// Files live in a `HashMap` behind a [`RwLock`] so every trait method works
/// on `&self`.
///
/// # Examples
///
/// ```
/// use mirage_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("ab/abcdef.mdl", b"model")]);
/// assert!(backend.exists(Path::new("ab/abcdef.mdl")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation: broken test setup should never
    /// produce a passing test.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let map = files
            .into_iter()
            .map(|(path, data)| {
                let path = path.into();
                match validate_path(&path) {
                    Ok(validated) => (validated, data.into()),
                    Err(_) => panic!("MockBackend::with_files: invalid path {}", path.display()),
                }
            })
            .collect();
        Self { name: "mock".to_string(), storage: RwLock::new(map), writes: AtomicUsize::new(0) }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Overwrite a file's bytes in place, bypassing every check. Used to
    /// simulate on-disk corruption.
    pub async fn corrupt(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        if let Some(entry) = self.storage.write().await.get_mut(path.as_ref()) {
            *entry = data.into();
        }
    }

    /// Number of successful [`write`](StorageBackend::write) calls, to check
    /// that content is written once per hash.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        Self::with_files(std::iter::empty::<(PathBuf, Vec<u8>)>())
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let data = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(data.clone())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.insert(path, data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        match self.storage.write().await.remove(&path) {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        let mut guard = self.storage.write().await;
        let data = guard.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        guard.insert(to, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("ab/abcdef.mdl"), b"hello").await.unwrap();
        assert_eq!(backend.read(Path::new("ab/abcdef.mdl")).await.unwrap(), b"hello");
        assert_eq!(backend.local_path(Path::new("ab/abcdef.mdl")), None);
    }

    #[tokio::test]
    async fn test_rename() {
        let backend = MockBackend::with_files([("ab/abcdef", b"12345")]);
        backend.rename(Path::new("ab/abcdef"), Path::new("ab/abcdef.tex")).await.unwrap();
        assert!(!backend.exists(Path::new("ab/abcdef")).await.unwrap());
        assert_eq!(backend.read(Path::new("ab/abcdef.tex")).await.unwrap(), b"12345");
        assert_eq!(backend.len().await, 1);
        let err = backend.rename(Path::new("ab/abcdef"), Path::new("ab/x")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_corrupt() {
        let backend = MockBackend::with_files([("ab/abcdef", b"good")]);
        backend.corrupt("ab/abcdef", b"bad".to_vec()).await;
        assert_eq!(backend.read(Path::new("ab/abcdef")).await.unwrap(), b"bad");
    }

    #[tokio::test]
    async fn test_write_count() {
        let backend = MockBackend::with_files([("ab/1", b"a")]);
        assert_eq!(backend.write_count(), 0);
        backend.write(Path::new("ab/2"), b"b").await.unwrap();
        backend.write(Path::new("ab/2"), b"c").await.unwrap();
        assert_eq!(backend.write_count(), 2);
        assert_eq!(backend.len().await, 2);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", b"bad")]);
    }
}
