//! Path validation for storage-relative paths.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Normalizes a storage-relative path and rejects anything that could leave
/// the backend root.
///
/// `.` and empty components are dropped, `..` is resolved lexically and may
/// never climb above the root. Null bytes and Windows prefixes are rejected
/// outright, as is a path that normalizes to nothing.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mirage_storage::validate_path;
///
/// assert_eq!(validate_path("ab//abcdef.mdl").unwrap(), Path::new("ab/abcdef.mdl"));
/// assert!(validate_path("../index.sqlite").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let reject = || exn::Exn::from(ErrorKind::InvalidPath(original.to_path_buf()));
    let mut normalized: Vec<_> = Vec::new();
    for component in original.components() {
        match component {
            // Null bytes survive Path::components() on Unix and truncate
            // paths in C-based syscalls.
            Component::Normal(part) if part.as_encoded_bytes().contains(&0) => return Err(reject()),
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => return Err(reject()),
            Component::ParentDir => {
                normalized.pop().ok_or_else(reject)?;
            },
        }
    }
    if normalized.is_empty() {
        return Err(reject());
    }
    Ok(normalized.into_iter().collect())
}
