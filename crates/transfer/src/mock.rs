//! In-memory remote store for testing.

use crate::error::{ErrorKind, Result};
use crate::remote::{Availability, RemoteStore};
use async_trait::async_trait;
use mirage_model::{ContentHash, PeerId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Remote store backed by a `HashMap`.
///
/// Content registered with [`with_content`](Self::with_content) is served
/// under its real BLAKE3 hash. Individual hashes can be made to refuse, fail,
/// or serve tampered bytes, and every call is counted.
#[derive(Default)]
pub struct MockRemote {
    content: Mutex<HashMap<ContentHash, Vec<u8>>>,
    refused: Mutex<HashSet<ContentHash>>,
    failing: Mutex<HashSet<ContentHash>>,
    tampered: Mutex<HashSet<ContentHash>>,
    queries: Mutex<Vec<Vec<ContentHash>>>,
    fetches: Mutex<Vec<ContentHash>>,
    latency: Mutex<Option<Duration>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content<I, B>(self, files: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        for bytes in files {
            self.add(bytes);
        }
        self
    }

    /// Makes `bytes` available and returns its hash.
    pub fn add(&self, bytes: impl Into<Vec<u8>>) -> ContentHash {
        let bytes = bytes.into();
        let hash = ContentHash::of(&bytes);
        self.content.lock().insert(hash.clone(), bytes);
        hash
    }

    pub fn refuse(&self, hash: &ContentHash) {
        self.refused.lock().insert(hash.clone());
    }

    /// Every fetch of `hash` fails until [`heal`](Self::heal) is called.
    pub fn fail(&self, hash: &ContentHash) {
        self.failing.lock().insert(hash.clone());
    }

    pub fn heal(&self, hash: &ContentHash) {
        self.failing.lock().remove(hash);
        self.tampered.lock().remove(hash);
    }

    /// Serves bytes that don't match `hash`.
    pub fn tamper(&self, hash: &ContentHash) {
        self.tampered.lock().insert(hash.clone());
    }

    /// Delay applied to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of fetch calls made for `hash`.
    pub fn fetch_count(&self, hash: &ContentHash) -> usize {
        self.fetches.lock().iter().filter(|h| *h == hash).count()
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn query_missing(&self, _peer: &PeerId, hashes: &[ContentHash]) -> Result<HashMap<ContentHash, Availability>> {
        self.queries.lock().push(hashes.to_vec());
        let content = self.content.lock();
        let refused = self.refused.lock();
        Ok(hashes
            .iter()
            .map(|hash| {
                let availability = match content.get(hash) {
                    _ if refused.contains(hash) => Availability::Refused,
                    Some(bytes) => Availability::Available { size: bytes.len() as u64 },
                    None => Availability::Pending,
                };
                (hash.clone(), availability)
            })
            .collect())
    }

    async fn fetch(&self, _peer: &PeerId, hash: &ContentHash, token: &CancellationToken) -> Result<Vec<u8>> {
        self.fetches.lock().push(hash.clone());
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::select! {
                () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                () = tokio::time::sleep(latency) => {},
            }
        }
        if self.failing.lock().contains(hash) {
            exn::bail!(ErrorKind::Remote(format!("simulated failure for {hash}")));
        }
        let bytes = self.content.lock().get(hash).cloned();
        match bytes {
            Some(_) if self.tampered.lock().contains(hash) => Ok(b"tampered".to_vec()),
            Some(bytes) => Ok(bytes),
            None => exn::bail!(ErrorKind::Remote(format!("unknown hash {hash}"))),
        }
    }
}
