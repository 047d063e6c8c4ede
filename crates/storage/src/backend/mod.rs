//! Storage backend trait and implementations.
//!
//! The content store keeps one file per content hash. How those files are
//! kept is up to the backend: the local filesystem in production, a
//! `HashMap` in tests.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Unified interface for blob storage.
///
/// All paths are relative to the backend root and are validated with
/// [`validate_path`](crate::validate_path) by every implementation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mirage_storage::{backend::StorageBackend, error::Result};
///
/// async fn read_if_cached(backend: &dyn StorageBackend, path: &Path) -> Result<Option<Vec<u8>>> {
///     if !backend.exists(path).await? {
///         return Ok(None);
///     }
///     Ok(Some(backend.read(path).await?))
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend, used for logging only.
    fn name(&self) -> &str;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read the complete file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or overwrite a file, creating parent directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Rename a file within the same backend, overwriting the destination.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the source
    /// file does not exist.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Absolute filesystem location of a stored file, for adapters that need
    /// to hand a real path to the game.
    ///
    /// Backends that don't live on the filesystem return `None`.
    fn local_path(&self, path: &Path) -> Option<PathBuf> {
        _ = path;
        None
    }
}
