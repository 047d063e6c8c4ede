//! Contract with whatever serves content for remote peers.

use crate::error::Result;
use async_trait::async_trait;
use mirage_model::{ContentHash, PeerId};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// What the remote side knows about one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available { size: u64 },
    /// The remote will never serve this hash.
    Refused,
    /// Not uploaded (yet). Asking again later may help.
    Pending,
}

/// Source of content referenced by a peer's snapshot.
///
/// The transport behind it (and any chunking or compression on the wire) is
/// entirely up to the implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Availability for each requested hash. Hashes missing from the answer
    /// are treated as [`Availability::Pending`].
    async fn query_missing(&self, peer: &PeerId, hashes: &[ContentHash]) -> Result<HashMap<ContentHash, Availability>>;

    /// Complete contents of one file.
    ///
    /// Implementations should stop early when `token` fires; the caller
    /// stops waiting either way.
    async fn fetch(&self, peer: &PeerId, hash: &ContentHash, token: &CancellationToken) -> Result<Vec<u8>>;
}
