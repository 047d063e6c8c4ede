//! Content-addressable cache for mod files.
//!
//! Files are keyed by the BLAKE3 hash of their contents and stored through a
//! [`mirage_storage`] backend under `<shard>/<hash>.<extension>`. A SQLite
//! index remembers what's cached between runs; it can always be rebuilt, the
//! files are the source of truth.

mod db;
mod entry;
pub mod error;
mod repo;
mod store;

pub use crate::db::Database;
pub use crate::entry::{CacheEntry, Location, ResolvedContent};
pub use crate::repo::Repository;
pub use crate::store::{ContentStore, Integrity, StoreStats, VerifyEvent};

/// Upper bound on concurrent store lookups or verifications.
pub const MAX_LOOKUP_CONCURRENCY: usize = 4;
