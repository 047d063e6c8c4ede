//! Content store error types.
//!
//! Uses [`exn`] for location tracking and error trees, same as every other
//! crate in the workspace.

use derive_more::{Display, Error};

/// A content store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for content store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Reading or writing a cached file through the storage backend failed.
    #[display("storage error")]
    Storage,
    /// Received bytes don't hash to the content hash they were sent for.
    #[display("content hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        #[error(not(source))]
        expected: String,
        #[error(not(source))]
        actual: String,
    },
    #[display("content not cached: {_0}")]
    NotCached(#[error(not(source))] String),
    /// No substitute location was configured for this store.
    #[display("no substitute location configured")]
    NoSubstitute,
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// An integrity mismatch is worth retrying: the next transfer of the same
    /// hash may well arrive intact.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::IntegrityMismatch { .. })
    }
}
