//! Sync error types.
//!
//! Nothing in here escapes [`PeerRegistry`](crate::PeerRegistry): every
//! public entry point there logs at its boundary. The kinds still matter
//! inside a session, where they decide between retrying, skipping, redoing
//! everything next time, or quietly unwinding.

use derive_more::{Display, Error};
use mirage_model::Capability;

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// ### Session Errors
/// - [`ErrorKind::TransientFetchFailure`]: retried, then abandoned for the session.
/// - [`ErrorKind::AdapterFailure`]: logged, sibling capabilities carry on.
/// - [`ErrorKind::TargetInvalidated`]: session aborted, next one redoes everything.
/// - [`ErrorKind::PermanentlyForbiddenContent`]: retrying stops early.
/// - [`ErrorKind::Cancelled`]: clean unwind, never logged as an error.
///
/// ### Infrastructure Errors
/// - [`ErrorKind::Executor`]
/// - [`ErrorKind::RevertTimedOut`]
/// - [`ErrorKind::InvalidSnapshot`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("content transfer failed")]
    TransientFetchFailure,
    #[display("capability adapter for {_0} failed")]
    AdapterFailure(#[error(not(source))] Capability),
    #[display("target became invalid")]
    TargetInvalidated,
    #[display("{_0} content hashes are permanently unavailable")]
    PermanentlyForbiddenContent(#[error(not(source))] usize),
    #[display("cancelled")]
    Cancelled,
    /// The target-affine executor has shut down.
    #[display("target executor unavailable")]
    Executor,
    #[display("revert did not finish in time")]
    RevertTimedOut,
    /// A received snapshot could not be rebuilt after stripping content.
    #[display("invalid snapshot")]
    InvalidSnapshot,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetchFailure | Self::AdapterFailure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
