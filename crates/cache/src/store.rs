use crate::entry::{CacheEntry, Location, ResolvedContent, entry_path, normalize_extension};
use crate::error::{ErrorKind, Result};
use crate::repo::Repository;
use crate::{Database, MAX_LOOKUP_CONCURRENCY};
use async_stream::stream;
use exn::{OptionExt, ResultExt};
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use mirage_model::ContentHash;
use mirage_storage::BackendHandle;
use mirage_storage::error::ErrorKind as StorageErrorKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

/// Outcome of re-hashing one cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Intact,
    /// The index knows the hash but the file is gone.
    Missing,
    /// The stored bytes hash to something else.
    Corrupt(ContentHash),
}

/// Progress events emitted by [`ContentStore::verify`].
///
/// [`Started`](Self::Started) and [`DiscoveryComplete`](Self::DiscoveryComplete)
/// come first, then one [`Verified`](Self::Verified) per entry in completion
/// order, then [`Complete`](Self::Complete).
#[derive(Debug)]
pub enum VerifyEvent {
    Started,
    DiscoveryComplete(u64),
    Verified(CacheEntry, Integrity),
    Complete,
}

/// Aggregate numbers for the in-memory view of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_size: u64,
    pub substitutes: usize,
    pub legacy: usize,
}

/// Content-addressable file cache.
///
/// Content is written once per hash and never modified afterwards. The only
/// in-place mutation is [`migrate_extension`](Self::migrate_extension), which
/// renames legacy extensionless files and marks the persisted index for a
/// full rewrite.
///
/// The store starts out empty: call [`load`](Self::load) to read the
/// persisted index.
pub struct ContentStore {
    backend: BackendHandle,
    substitute: Option<BackendHandle>,
    index: Repository,
    entries: RwLock<HashMap<ContentHash, CacheEntry>>,
    dirty: AtomicBool,
}

impl ContentStore {
    pub fn open(backend: BackendHandle, substitute: Option<BackendHandle>, database: &Database) -> Self {
        Self {
            backend,
            substitute,
            index: Repository::from(database),
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Replaces the in-memory view with the persisted index.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn load(&self) -> Result<usize> {
        let loaded: HashMap<_, _> = self.index.list().await?.into_iter().map(|e| (e.hash.clone(), e)).collect();
        let count = loaded.len();
        *self.entries.write() = loaded;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(count, "loaded content index");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// `true` once the in-memory view has diverged from the persisted index.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn has_substitute(&self) -> bool {
        self.substitute.is_some()
    }

    /// Cached entry for `hash`, without touching storage.
    pub fn entry(&self, hash: &ContentHash) -> Option<CacheEntry> {
        self.entries.read().get(hash).cloned()
    }

    pub fn stats(&self) -> StoreStats {
        let entries = self.entries.read();
        StoreStats {
            entries: entries.len(),
            total_size: entries.values().map(|e| e.size).sum(),
            substitutes: entries.values().filter(|e| e.substitute).count(),
            legacy: entries.values().filter(|e| e.is_legacy()).count(),
        }
    }

    /// Resolves `hash` to a stored file.
    ///
    /// With `prefer_substitute` the substitute copy wins when both exist.
    /// An indexed entry whose file has vanished from every location is
    /// dropped and `None` is returned.
    ///
    /// Safe to call concurrently; callers fan out up to
    /// [`MAX_LOOKUP_CONCURRENCY`] lookups at a time.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn lookup(&self, hash: &ContentHash, prefer_substitute: bool) -> Result<Option<ResolvedContent>> {
        let Some(entry) = self.entry(hash) else {
            return Ok(None);
        };
        let order = match prefer_substitute {
            true => [Location::Substitute, Location::Primary],
            false => [Location::Primary, Location::Substitute],
        };
        for location in order {
            let backend = match location {
                Location::Primary => &self.backend,
                Location::Substitute if entry.substitute => match &self.substitute {
                    Some(backend) => backend,
                    None => continue,
                },
                Location::Substitute => continue,
            };
            if backend.exists(&entry.path).await.or_raise(|| ErrorKind::Storage)? {
                return Ok(Some(ResolvedContent { entry, location }));
            }
        }
        tracing::debug!("cached file vanished, dropping entry");
        if self.entries.write().remove(hash).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(None)
    }

    /// Absolute path of resolved content, if its backend lives on disk.
    pub fn local_path(&self, resolved: &ResolvedContent) -> Option<PathBuf> {
        match resolved.location {
            Location::Primary => self.backend.local_path(&resolved.entry.path),
            Location::Substitute => self.substitute.as_ref()?.local_path(&resolved.entry.path),
        }
    }

    /// Stores `bytes` under `hash`.
    ///
    /// Content is immutable once cached: inserting a hash that's already
    /// known returns the existing entry without writing anything. Bytes that
    /// don't hash to `hash` are rejected with
    /// [`IntegrityMismatch`](ErrorKind::IntegrityMismatch).
    #[instrument(skip(self, bytes), fields(hash = %hash, size = bytes.len()))]
    pub async fn insert(&self, hash: &ContentHash, extension: Option<&str>, bytes: &[u8]) -> Result<CacheEntry> {
        if let Some(existing) = self.entry(hash) {
            return Ok(existing);
        }
        let actual = ContentHash::of(bytes);
        if &actual != hash {
            exn::bail!(ErrorKind::IntegrityMismatch { expected: hash.to_string(), actual: actual.to_string() });
        }
        let entry = CacheEntry::new(hash.clone(), extension.and_then(normalize_extension), bytes.len() as u64);
        self.backend.write(&entry.path, bytes).await.or_raise(|| ErrorKind::Storage)?;
        self.index.upsert(&entry).await?;
        self.entries.write().insert(hash.clone(), entry.clone());
        tracing::debug!(path = %entry.path.display(), "cached content");
        Ok(entry)
    }

    /// Gives a legacy extensionless entry its extension.
    ///
    /// The file is renamed in every location it exists in and the index is
    /// marked for a full rewrite; see [`persist_index`](Self::persist_index).
    /// Entries that already have an extension are returned unchanged.
    #[instrument(skip(self, entry), fields(hash = %entry.hash))]
    pub async fn migrate_extension(&self, entry: &CacheEntry, extension: &str) -> Result<CacheEntry> {
        if !entry.is_legacy() {
            return Ok(entry.clone());
        }
        let extension = normalize_extension(extension).ok_or_raise(|| ErrorKind::InvalidData("extension"))?;
        let mut migrated = entry.clone();
        migrated.path = entry_path(&entry.hash, Some(&extension));
        migrated.extension = Some(extension);

        self.backend.rename(&entry.path, &migrated.path).await.or_raise(|| ErrorKind::Storage)?;
        if let (true, Some(substitute)) = (entry.substitute, &self.substitute) {
            match substitute.rename(&entry.path, &migrated.path).await {
                Ok(()) => {},
                Err(e) if matches!(e.deref(), StorageErrorKind::NotFound(_)) => migrated.substitute = false,
                Err(e) => Err(e).or_raise(|| ErrorKind::Storage)?,
            }
        }
        self.entries.write().insert(migrated.hash.clone(), migrated.clone());
        self.dirty.store(true, Ordering::Release);
        tracing::debug!(path = %migrated.path.display(), "migrated legacy entry");
        Ok(migrated)
    }

    /// Rewrites the persisted index from the in-memory view.
    #[instrument(skip(self))]
    pub async fn persist_index(&self) -> Result<u64> {
        let entries: Vec<CacheEntry> = self.entries.read().values().cloned().collect();
        let written = self.index.replace_all(&entries).await?;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(written, "persisted content index");
        Ok(written)
    }

    /// [`persist_index`](Self::persist_index), but only when something changed.
    pub async fn persist_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.persist_index().await?;
        Ok(true)
    }

    /// Copies a cached file into the substitute location.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn promote_substitute(&self, hash: &ContentHash) -> Result<CacheEntry> {
        let substitute = self.substitute.as_ref().ok_or_raise(|| ErrorKind::NoSubstitute)?;
        let mut entry = self.entry(hash).ok_or_raise(|| ErrorKind::NotCached(hash.to_string()))?;
        if entry.substitute && substitute.exists(&entry.path).await.or_raise(|| ErrorKind::Storage)? {
            return Ok(entry);
        }
        let bytes = self.backend.read(&entry.path).await.or_raise(|| ErrorKind::Storage)?;
        substitute.write(&entry.path, &bytes).await.or_raise(|| ErrorKind::Storage)?;
        entry.substitute = true;
        self.index.upsert(&entry).await?;
        self.entries.write().insert(hash.clone(), entry.clone());
        Ok(entry)
    }

    /// Drops an entry and deletes its files. Returns `false` if the hash
    /// wasn't cached.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn forget(&self, hash: &ContentHash) -> Result<bool> {
        let removed = self.entries.write().remove(hash);
        let indexed = self.index.delete(hash).await?;
        let Some(entry) = removed else {
            return Ok(indexed);
        };
        let backends = std::iter::once(&self.backend).chain(self.substitute.as_ref().filter(|_| entry.substitute));
        for backend in backends {
            match backend.delete(&entry.path).await {
                Ok(()) => {},
                Err(e) if matches!(e.deref(), StorageErrorKind::NotFound(_)) => {},
                Err(e) => Err(e).or_raise(|| ErrorKind::Storage)?,
            }
        }
        Ok(true)
    }

    /// Re-hashes every cached file.
    ///
    /// Files are checked up to [`MAX_LOOKUP_CONCURRENCY`] at a time. A
    /// storage failure on one file surfaces as an `Err` item without ending
    /// the stream.
    pub fn verify(&self) -> impl Stream<Item = Result<VerifyEvent>> + '_ {
        stream!({
            yield Ok(VerifyEvent::Started);
            let entries: Vec<CacheEntry> = self.entries.read().values().cloned().collect();
            yield Ok(VerifyEvent::DiscoveryComplete(entries.len() as u64));

            let mut pending = entries.into_iter().map(|entry| self.verify_entry(entry));
            let mut checking = FuturesUnordered::new();
            checking.extend(pending.by_ref().take(MAX_LOOKUP_CONCURRENCY));
            while let Some(result) = checking.next().await {
                yield result.map(|(entry, integrity)| VerifyEvent::Verified(entry, integrity));
                if let Some(next) = pending.next() {
                    checking.push(next);
                }
            }

            yield Ok(VerifyEvent::Complete);
        })
    }

    async fn verify_entry(&self, entry: CacheEntry) -> Result<(CacheEntry, Integrity)> {
        let integrity = match self.backend.read(&entry.path).await {
            Ok(bytes) => match ContentHash::of(&bytes) {
                actual if actual == entry.hash => Integrity::Intact,
                actual => Integrity::Corrupt(actual),
            },
            Err(e) if matches!(e.deref(), StorageErrorKind::NotFound(_)) => Integrity::Missing,
            Err(e) => Err(e).or_raise(|| ErrorKind::Storage)?,
        };
        if integrity != Integrity::Intact {
            tracing::warn!(hash = %entry.hash, ?integrity, "cached content failed verification");
        }
        Ok((entry, integrity))
    }

    /// Backend the primary copies live in.
    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("backend", &self.backend.name())
            .field("substitute", &self.substitute.as_ref().map(|s| s.name().to_string()))
            .field("entries", &self.len())
            .finish()
    }
}
