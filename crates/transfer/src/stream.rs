use crate::error::{ErrorKind, Result};
use crate::orchestrator::{DownloadItem, ForbiddenContent, ForbiddenReason, InFlightClaim, TransferOrchestrator};
use async_stream::stream;
use exn::ResultExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use mirage_model::{ContentHash, FileReplacement, PeerId};
use std::pin::pin;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Progress events emitted by [`TransferOrchestrator::fetch_stream`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started), exactly once.
/// 2. [`Forbidden`](Self::Forbidden) and [`InFlightElsewhere`](Self::InFlightElsewhere),
///    zero or more times.
/// 3. [`DiscoveryComplete`](Self::DiscoveryComplete), exactly once, with the
///    number of hashes that will be fetched.
/// 4. [`Fetched`](Self::Fetched) or [`Failed`](Self::Failed), once per hash.
/// 5. [`Complete`](Self::Complete), exactly once.
///
/// Cancellation ends the stream early with a
/// [`Cancelled`](ErrorKind::Cancelled) error and no `Complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Started,
    Forbidden(ForbiddenContent),
    /// Another session is already downloading this hash.
    InFlightElsewhere(ContentHash),
    DiscoveryComplete(u64),
    Fetched { hash: ContentHash, size: u64 },
    Failed { hash: ContentHash, error: String, forbidden: Option<ForbiddenReason> },
    Complete,
}

/// Everything a [`fetch`](TransferOrchestrator::fetch) call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: Vec<ContentHash>,
    pub failed: Vec<ContentHash>,
    pub forbidden: Vec<ForbiddenContent>,
    pub in_flight_elsewhere: Vec<ContentHash>,
}

enum FetchOutcome {
    Fetched { hash: ContentHash, size: u64 },
    Failed { hash: ContentHash, error: String, forbidden: Option<ForbiddenReason> },
    Cancelled,
}

impl TransferOrchestrator {
    /// Downloads the content behind `replacements` into the store, streaming
    /// progress as it goes.
    ///
    /// Only hashes that are still missing from the store are requested, so a
    /// repeated call after a partial failure picks up where the last one left
    /// off. Up to `max_parallel_downloads` fetches run at once.
    pub fn fetch_stream<'a>(
        &'a self,
        peer: &'a PeerId,
        replacements: &'a [FileReplacement],
        token: &'a CancellationToken,
    ) -> impl Stream<Item = Result<FetchEvent>> + 'a {
        stream!({
            yield Ok(FetchEvent::Started);

            let list = match self.initiate_download_list(peer, replacements, token).await {
                Ok(list) => list,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            for forbidden in list.forbidden {
                yield Ok(FetchEvent::Forbidden(forbidden));
            }

            let mut claimed = Vec::new();
            for item in list.to_fetch {
                if self.store.entry(&item.hash).is_some() {
                    continue;
                }
                match self.claim(&item.hash) {
                    Some(claim) => claimed.push((item, claim)),
                    None => yield Ok(FetchEvent::InFlightElsewhere(item.hash)),
                }
            }
            yield Ok(FetchEvent::DiscoveryComplete(claimed.len() as u64));

            let mut pending = claimed.into_iter().map(|(item, claim)| self.fetch_one(peer, item, claim, token));
            let mut fetching = FuturesUnordered::new();
            fetching.extend(pending.by_ref().take(self.settings.max_parallel_downloads.max(1)));
            while let Some(outcome) = fetching.next().await {
                match outcome {
                    FetchOutcome::Fetched { hash, size } => yield Ok(FetchEvent::Fetched { hash, size }),
                    FetchOutcome::Failed { hash, error, forbidden } => {
                        yield Ok(FetchEvent::Failed { hash, error, forbidden })
                    },
                    FetchOutcome::Cancelled => {
                        yield Err(exn::Exn::from(ErrorKind::Cancelled));
                        return;
                    },
                }
                if token.is_cancelled() {
                    yield Err(exn::Exn::from(ErrorKind::Cancelled));
                    return;
                }
                if let Some(next) = pending.next() {
                    fetching.push(next);
                }
            }

            yield Ok(FetchEvent::Complete);
        })
    }

    /// [`fetch_stream`](Self::fetch_stream), collected.
    #[instrument(skip_all, fields(peer = %peer, replacements = replacements.len()))]
    pub async fn fetch(
        &self,
        peer: &PeerId,
        replacements: &[FileReplacement],
        token: &CancellationToken,
    ) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        let mut events = pin!(self.fetch_stream(peer, replacements, token));
        while let Some(event) = events.next().await {
            match event? {
                FetchEvent::Fetched { hash, .. } => report.fetched.push(hash),
                FetchEvent::Failed { hash, .. } => report.failed.push(hash),
                FetchEvent::Forbidden(forbidden) => report.forbidden.push(forbidden),
                FetchEvent::InFlightElsewhere(hash) => report.in_flight_elsewhere.push(hash),
                FetchEvent::Started | FetchEvent::DiscoveryComplete(_) | FetchEvent::Complete => {},
            }
        }
        Ok(report)
    }

    async fn fetch_one(
        &self,
        peer: &PeerId,
        item: DownloadItem,
        _claim: InFlightClaim,
        token: &CancellationToken,
    ) -> FetchOutcome {
        let received = tokio::select! {
            () = token.cancelled() => return FetchOutcome::Cancelled,
            received = self.remote.fetch(peer, &item.hash, token) => received,
        };
        let stored = match received {
            Ok(bytes) => {
                self.store.insert(&item.hash, item.extension.as_deref(), &bytes).await.or_raise(|| ErrorKind::Store)
            },
            Err(e) if e.is_cancelled() => return FetchOutcome::Cancelled,
            Err(e) => Err(e),
        };
        match stored {
            Ok(entry) => {
                self.record_success(&item.hash);
                tracing::debug!(hash = %item.hash, size = entry.size, "fetched content");
                FetchOutcome::Fetched { hash: item.hash, size: entry.size }
            },
            Err(e) => {
                let forbidden = self.record_failure(&item.hash);
                tracing::warn!(hash = %item.hash, error = ?e, "failed to fetch content");
                FetchOutcome::Failed { hash: item.hash, error: (*e).to_string(), forbidden }
            },
        }
    }
}
