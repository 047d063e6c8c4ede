//! `mirage store` subcommands.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::{StreamExt, pin_mut};
use mirage_cache::{ContentStore, Database, Integrity, StoreStats, VerifyEvent};
use mirage_config::CacheConfig;
use mirage_model::ContentHash;
use mirage_storage::BackendHandle;
use mirage_storage::backend::LocalBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A loaded content store and the index connection backing it.
pub struct OpenStore {
    pub store: ContentStore,
    database: Database,
}

impl OpenStore {
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let root = absolute(&config.root)?;
        let index = absolute(&config.index)?;
        let failed = || ErrorKind::Open(root.display().to_string());
        if let Some(parent) = index.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(failed)?;
        }
        let backend: BackendHandle = Arc::new(LocalBackend::new("content", &root).or_raise(failed)?);
        let substitute = match &config.substitute_root {
            Some(path) => {
                let backend: BackendHandle = Arc::new(LocalBackend::new("substitute", absolute(path)?).or_raise(failed)?);
                Some(backend)
            },
            None => None,
        };
        let database = Database::connect(&index).await.or_raise(failed)?;
        let store = ContentStore::open(backend, substitute, &database);
        let count = store.load().await.or_raise(|| ErrorKind::Store)?;
        tracing::debug!(root = %root.display(), count, "content store opened");
        Ok(Self { store, database })
    }

    pub async fn close(self) {
        self.database.close().await;
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).or_raise(|| ErrorKind::Open(path.display().to_string()))
}

/// Outcome of a `store verify` run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub intact: u64,
    pub missing: u64,
    pub corrupt: u64,
    /// Entries that couldn't be read for reasons other than being absent.
    pub unreadable: u64,
    pub pruned: u64,
}

impl VerifySummary {
    pub fn is_clean(&self) -> bool {
        self.missing == 0 && self.corrupt == 0 && self.unreadable == 0
    }
}

/// Re-hashes every cached file. With `prune`, missing and corrupt entries
/// are forgotten and the index is persisted.
pub async fn verify(store: &ContentStore, prune: bool) -> Result<VerifySummary> {
    let mut summary = VerifySummary::default();
    let mut damaged: Vec<ContentHash> = Vec::new();
    let events = store.verify();
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(VerifyEvent::DiscoveryComplete(total)) => tracing::info!(total, "verifying cached content"),
            Ok(VerifyEvent::Verified(_, Integrity::Intact)) => summary.intact += 1,
            Ok(VerifyEvent::Verified(entry, Integrity::Missing)) => {
                summary.missing += 1;
                damaged.push(entry.hash);
            },
            Ok(VerifyEvent::Verified(entry, Integrity::Corrupt(_))) => {
                summary.corrupt += 1;
                damaged.push(entry.hash);
            },
            Ok(VerifyEvent::Started | VerifyEvent::Complete) => {},
            Err(error) => {
                summary.unreadable += 1;
                tracing::warn!(?error, "could not verify cached content");
            },
        }
    }

    if prune && !damaged.is_empty() {
        for hash in &damaged {
            if store.forget(hash).await.or_raise(|| ErrorKind::Store)? {
                summary.pruned += 1;
            }
        }
        store.persist_if_dirty().await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(pruned = summary.pruned, "damaged entries pruned");
    }
    Ok(summary)
}

pub fn render_stats(stats: &StoreStats) -> String {
    format!(
        "entries:     {}\ntotal size:  {} bytes\nsubstitutes: {}\nlegacy:      {}",
        stats.entries, stats.total_size, stats.substitutes, stats.legacy,
    )
}
