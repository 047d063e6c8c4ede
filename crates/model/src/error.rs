//! Model Error Types

use crate::kind::Capability;
use derive_more::{Display, Error};

/// A model error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Content hashes are non-empty hexadecimal strings.
    #[display("invalid content hash: {_0:?}")]
    InvalidHash(#[error(not(source))] String),
    #[display("invalid game path: {_0:?}")]
    InvalidGamePath(#[error(not(source))] String),
    /// A blob was supplied for a capability that is derived, not carried.
    #[display("capability {_0} does not carry blob data")]
    InvalidBlob(#[error(not(source))] Capability),
    /// A file replacement must map at least one game path.
    #[display("file replacement without game paths")]
    EmptyReplacement,
    #[display("snapshot could not be serialized")]
    Serialization,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
