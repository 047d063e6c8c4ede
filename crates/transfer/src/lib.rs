//! Getting snapshot content onto local storage.
//!
//! The [`TransferOrchestrator`] turns a snapshot's file replacements into
//! redirects: swaps point at other in-game paths, hashes resolve through the
//! [`ContentStore`](mirage_cache::ContentStore). Hashes the store doesn't
//! have are fetched from a [`RemoteStore`] with bounded parallelism,
//! verified, and written into the store.
//!
//! Retrying is left to the caller: [`fetch`](TransferOrchestrator::fetch)
//! makes one pass and reports what happened.

pub mod error;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod orchestrator;
mod remote;
mod stream;

#[cfg(any(test, feature = "mock"))]
pub use crate::mock::MockRemote;
pub use crate::orchestrator::{
    DownloadItem, DownloadList, ForbiddenContent, ForbiddenReason, MissingContent, Redirect, ResolvedFiles,
    TransferOrchestrator, TransferSettings,
};
pub use crate::remote::{Availability, RemoteStore};
pub use crate::stream::{FetchEvent, FetchReport};
