//! Transfer error types.

use derive_more::{Display, Error};

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// ### Operational Errors
/// - [`ErrorKind::Cancelled`]
/// - [`ErrorKind::Remote`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Store`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The caller's cancellation token fired. Not a failure.
    #[display("transfer cancelled")]
    Cancelled,
    /// The remote store could not answer or deliver.
    #[display("remote store error: {_0}")]
    Remote(#[error(not(source))] String),
    /// Reading from or writing to the [`ContentStore`](mirage_cache::ContentStore) failed.
    #[display("content store error")]
    Store,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Store)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
