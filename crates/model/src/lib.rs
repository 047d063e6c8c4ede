//! Appearance state exchanged between paired participants.
//!
//! A [`Snapshot`] is the full appearance of one participant: per
//! [`ObjectKind`], a set of [`FileReplacement`]s plus opaque per-capability
//! blobs. Snapshots are assembled with a [`SnapshotBuilder`] and carry a
//! content hash computed exactly once, at [`finalize`](SnapshotBuilder::finalize).
//!
//! [`diff::compare`] turns two snapshots into a [`ChangeSet`]: which
//! [`Capability`] of which [`ObjectKind`] needs to be re-applied.

pub mod diff;
pub mod error;
mod hash;
mod kind;
mod peer;
mod replacement;
mod snapshot;

pub use crate::diff::{ChangeSet, compare};
pub use crate::hash::ContentHash;
pub use crate::kind::{Capability, ObjectKind};
pub use crate::peer::PeerId;
pub use crate::replacement::{ContentCategory, FileReplacement, GamePath, Resolution, is_local_path};
pub use crate::snapshot::{CategoryData, Snapshot, SnapshotBuilder};
