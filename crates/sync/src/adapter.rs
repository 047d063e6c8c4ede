//! Contract with the plugins that actually change how a peer looks.

use crate::error::Result;
use crate::session::SessionId;
use crate::target::TargetHandle;
use async_trait::async_trait;
use mirage_model::{Capability, GamePath, ObjectKind, PeerId};
use mirage_transfer::Redirect;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where an adapter's calls may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Affinity {
    /// Must run on the target executor, one call at a time.
    Target,
    #[default]
    Any,
}

/// What to apply for one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Blob(String),
    Files(BTreeMap<GamePath, Redirect>),
    /// Redraw the target; carries no data.
    Redraw,
    /// The capability has no data any more and should be cleared.
    Clear,
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub peer: PeerId,
    pub session: SessionId,
    pub kind: ObjectKind,
    pub target: TargetHandle,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct RevertRequest {
    pub peer: PeerId,
    pub session: SessionId,
    pub kind: ObjectKind,
    /// `None` when the object isn't drawn any more.
    pub target: Option<TargetHandle>,
}

/// Applies one [`Capability`] to a target.
///
/// Adapters should return promptly once `token` fires; the coordinator stops
/// waiting for them either way. An adapter may raise
/// [`TargetInvalidated`](crate::error::ErrorKind::TargetInvalidated) to abort
/// the whole session; any other error only skips this one capability.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn capability(&self) -> Capability;

    /// Unavailable adapters are skipped; the user is told once.
    fn is_available(&self) -> bool {
        true
    }

    fn affinity(&self) -> Affinity {
        Affinity::Any
    }

    async fn apply(&self, request: &ApplyRequest, token: &CancellationToken) -> Result<()>;

    async fn revert(&self, request: &RevertRequest, token: &CancellationToken) -> Result<()>;

    /// Frees whatever was set up for `peer` across all of its applies, such
    /// as a temporary mod collection.
    async fn release_scope(&self, peer: &PeerId, token: &CancellationToken) -> Result<()> {
        _ = (peer, token);
        Ok(())
    }
}

pub type AdapterHandle = Arc<dyn CapabilityAdapter>;

/// The adapters known to the host, at most one per capability.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: BTreeMap<Capability, AdapterHandle>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter`, replacing any previous one for its capability.
    pub fn with(mut self, adapter: impl CapabilityAdapter + 'static) -> Self {
        self.insert(Arc::new(adapter));
        self
    }

    pub fn insert(&mut self, adapter: AdapterHandle) {
        self.adapters.insert(adapter.capability(), adapter);
    }

    pub fn get(&self, capability: Capability) -> Option<&AdapterHandle> {
        self.adapters.get(&capability)
    }

    /// Capabilities in `wanted` without a registered and available adapter.
    pub fn unavailable<'a>(&self, wanted: impl IntoIterator<Item = &'a Capability>) -> BTreeSet<Capability> {
        wanted.into_iter().filter(|c| self.get(**c).is_none_or(|a| !a.is_available())).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdapterHandle> {
        self.adapters.values()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.adapters.keys()).finish()
    }
}
