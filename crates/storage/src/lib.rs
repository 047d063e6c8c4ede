//! Blob storage for cached content files.
//!
//! The content store never touches the filesystem directly; it goes through a
//! [`StorageBackend`] so that tests can swap in an in-memory backend and the
//! cache can keep a secondary "substitute" location on another root.

pub mod backend;
pub mod error;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
