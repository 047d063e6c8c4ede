use crate::error::{ErrorKind, Result};
use crate::remote::{Availability, RemoteStore};
use derive_more::Display;
use exn::ResultExt;
use futures::StreamExt;
use mirage_cache::{ContentStore, MAX_LOOKUP_CONCURRENCY, ResolvedContent};
use mirage_model::{ContentHash, FileReplacement, GamePath, ObjectKind, PeerId, Resolution, Snapshot};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Limits the orchestrator works within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub max_parallel_downloads: usize,
    /// Content larger than this is never downloaded.
    pub max_file_size: Option<u64>,
    /// Failed fetches (including integrity failures) before a hash is given up on.
    pub max_failures_per_hash: u32,
    pub prefer_substitute: bool,
}
impl Default for TransferSettings {
    fn default() -> Self {
        Self { max_parallel_downloads: 4, max_file_size: None, max_failures_per_hash: 3, prefer_substitute: false }
    }
}

/// Why a hash will not be downloaded again.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    #[display("{size} bytes exceeds the {limit} byte limit")]
    Oversized { size: u64, limit: u64 },
    #[display("refused by remote")]
    Refused,
    #[display("failed {_0} times")]
    TooManyFailures(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenContent {
    pub hash: ContentHash,
    pub reason: ForbiddenReason,
}

/// Where a game path is redirected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// A file in the content store.
    Cached(ResolvedContent),
    /// Another in-game path.
    Swap(String),
    /// A literal local file.
    File(PathBuf),
}

/// A file replacement whose content isn't cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingContent {
    pub kind: ObjectKind,
    pub replacement: FileReplacement,
}

/// Result of [`TransferOrchestrator::resolve_missing`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedFiles {
    redirects: BTreeMap<ObjectKind, BTreeMap<GamePath, Redirect>>,
    missing: Vec<MissingContent>,
}

impl ResolvedFiles {
    fn insert(&mut self, kind: ObjectKind, replacement: &FileReplacement, redirect: Redirect) {
        let redirects = self.redirects.entry(kind).or_default();
        for path in replacement.game_paths() {
            redirects.insert(path.clone(), redirect.clone());
        }
    }

    pub fn redirects(&self, kind: ObjectKind) -> Option<&BTreeMap<GamePath, Redirect>> {
        self.redirects.get(&kind)
    }

    pub fn missing(&self) -> &[MissingContent] {
        &self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing_hashes(&self) -> BTreeSet<ContentHash> {
        self.missing.iter().filter_map(|m| m.replacement.hash()).cloned().collect()
    }

    pub fn missing_replacements(&self) -> Vec<FileReplacement> {
        self.missing.iter().map(|m| m.replacement.clone()).collect()
    }
}

/// One hash the remote will serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub hash: ContentHash,
    pub extension: Option<String>,
    pub size: u64,
}

/// Result of [`TransferOrchestrator::initiate_download_list`].
///
/// Hashes the remote doesn't have yet appear in neither list.
#[derive(Debug, Clone, Default)]
pub struct DownloadList {
    pub to_fetch: Vec<DownloadItem>,
    pub forbidden: Vec<ForbiddenContent>,
}

/// Removes its hash from the in-flight set when dropped, so abandoned or
/// cancelled downloads never block another peer's request for the same
/// content.
pub(crate) struct InFlightClaim {
    in_flight: Arc<Mutex<HashSet<ContentHash>>>,
    hash: ContentHash,
}
impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.hash);
    }
}

/// Resolves snapshot content against the [`ContentStore`] and fetches what
/// is missing from a [`RemoteStore`].
///
/// One orchestrator is shared by every peer. It remembers which hashes are
/// forbidden and which are currently being downloaded, so two peers
/// referencing the same content never fetch it twice at once.
pub struct TransferOrchestrator {
    pub(crate) store: Arc<ContentStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) settings: TransferSettings,
    forbidden: Mutex<HashMap<ContentHash, ForbiddenReason>>,
    failures: Mutex<HashMap<ContentHash, u32>>,
    in_flight: Arc<Mutex<HashSet<ContentHash>>>,
}

impl TransferOrchestrator {
    pub fn new(store: Arc<ContentStore>, remote: Arc<dyn RemoteStore>, settings: TransferSettings) -> Self {
        Self {
            store,
            remote,
            settings,
            forbidden: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn is_forbidden(&self, hash: &ContentHash) -> bool {
        self.forbidden.lock().contains_key(hash)
    }

    pub fn forbidden(&self) -> Vec<ForbiddenContent> {
        self.forbidden.lock().iter().map(|(hash, reason)| ForbiddenContent { hash: hash.clone(), reason: *reason }).collect()
    }

    /// Looks every file replacement of `snapshot` up in the store.
    ///
    /// Swaps and literal local files are redirected directly and never touch
    /// the store. Legacy cache entries get their extension migrated on the
    /// way; if any were, the store's index is rewritten before returning.
    #[instrument(skip_all, fields(snapshot = %snapshot.content_hash()))]
    pub async fn resolve_missing(&self, snapshot: &Snapshot) -> Result<ResolvedFiles> {
        let mut resolved = ResolvedFiles::default();
        let mut cached = Vec::new();
        for (kind, replacement) in snapshot.files() {
            let redirect = match replacement.resolution() {
                Resolution::Hash(_) => {
                    cached.push((kind, replacement.clone()));
                    continue;
                },
                Resolution::Target(target) if replacement.is_swap() => Redirect::Swap(target.clone()),
                Resolution::Target(target) => Redirect::File(PathBuf::from(target)),
            };
            resolved.insert(kind, replacement, redirect);
        }

        let lookups: Vec<_> = futures::stream::iter(cached)
            .map(|(kind, replacement)| async move {
                let result = self.lookup(&replacement).await;
                (kind, replacement, result)
            })
            .buffer_unordered(MAX_LOOKUP_CONCURRENCY)
            .collect()
            .await;
        for (kind, replacement, result) in lookups {
            match result? {
                Some(content) => resolved.insert(kind, &replacement, Redirect::Cached(content)),
                None => resolved.missing.push(MissingContent { kind, replacement }),
            }
        }

        if let Err(e) = self.store.persist_if_dirty().await {
            tracing::error!(error = ?e, "failed to persist content index");
        }
        tracing::debug!(missing = resolved.missing.len(), "resolved snapshot content");
        Ok(resolved)
    }

    async fn lookup(&self, replacement: &FileReplacement) -> Result<Option<ResolvedContent>> {
        let Some(hash) = replacement.hash() else {
            return Ok(None);
        };
        let found = self.store.lookup(hash, self.settings.prefer_substitute).await.or_raise(|| ErrorKind::Store)?;
        let Some(mut content) = found else {
            return Ok(None);
        };
        if content.entry.is_legacy()
            && let Some(extension) = replacement.extension()
        {
            content.entry =
                self.store.migrate_extension(&content.entry, extension).await.or_raise(|| ErrorKind::Store)?;
        }
        Ok(Some(content))
    }

    /// Asks the remote which of the hashes behind `replacements` it can
    /// serve.
    ///
    /// Hashes that are already forbidden aren't asked about again. Refused
    /// and oversized hashes become forbidden and are reported as such, so the
    /// caller can stop retrying them specifically.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn initiate_download_list(
        &self,
        peer: &PeerId,
        replacements: &[FileReplacement],
        token: &CancellationToken,
    ) -> Result<DownloadList> {
        let mut wanted: BTreeMap<ContentHash, Option<String>> = BTreeMap::new();
        for replacement in replacements.iter().filter(|r| !r.is_swap()) {
            if let Some(hash) = replacement.hash() {
                wanted.entry(hash.clone()).or_insert_with(|| replacement.extension().map(str::to_string));
            }
        }

        let mut list = DownloadList::default();
        let mut query = Vec::new();
        {
            let forbidden = self.forbidden.lock();
            for hash in wanted.keys() {
                match forbidden.get(hash) {
                    Some(reason) => list.forbidden.push(ForbiddenContent { hash: hash.clone(), reason: *reason }),
                    None => query.push(hash.clone()),
                }
            }
        }
        if query.is_empty() {
            return Ok(list);
        }

        let answer = tokio::select! {
            () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            answer = self.remote.query_missing(peer, &query) => answer?,
        };
        for hash in query {
            match answer.get(&hash).copied().unwrap_or(Availability::Pending) {
                Availability::Available { size } => match self.settings.max_file_size {
                    Some(limit) if size > limit => {
                        list.forbidden.push(self.forbid(hash, ForbiddenReason::Oversized { size, limit }));
                    },
                    _ => {
                        let extension = wanted.remove(&hash).flatten();
                        list.to_fetch.push(DownloadItem { hash, extension, size });
                    },
                },
                Availability::Refused => list.forbidden.push(self.forbid(hash, ForbiddenReason::Refused)),
                Availability::Pending => tracing::debug!(hash = %hash, "content not available yet"),
            }
        }
        Ok(list)
    }

    fn forbid(&self, hash: ContentHash, reason: ForbiddenReason) -> ForbiddenContent {
        tracing::warn!(hash = %hash, %reason, "content forbidden");
        self.forbidden.lock().insert(hash.clone(), reason);
        ForbiddenContent { hash, reason }
    }

    /// Counts a failed fetch. Returns the reason if `hash` just became
    /// forbidden.
    pub(crate) fn record_failure(&self, hash: &ContentHash) -> Option<ForbiddenReason> {
        let failures = {
            let mut counts = self.failures.lock();
            let count = counts.entry(hash.clone()).or_insert(0);
            *count += 1;
            *count
        };
        (failures >= self.settings.max_failures_per_hash).then(|| {
            self.failures.lock().remove(hash);
            self.forbid(hash.clone(), ForbiddenReason::TooManyFailures(failures)).reason
        })
    }

    pub(crate) fn record_success(&self, hash: &ContentHash) {
        self.failures.lock().remove(hash);
    }

    /// Marks `hash` as being downloaded. `None` if someone else already is.
    pub(crate) fn claim(&self, hash: &ContentHash) -> Option<InFlightClaim> {
        self.in_flight
            .lock()
            .insert(hash.clone())
            .then(|| InFlightClaim { in_flight: self.in_flight.clone(), hash: hash.clone() })
    }

    pub fn is_in_flight(&self, hash: &ContentHash) -> bool {
        self.in_flight.lock().contains(hash)
    }
}
