//! Every peer the local client knows about, and the host-facing entry
//! points that drive their coordinators.
//!
//! Nothing here returns an error: failures are logged where they happen and
//! callers get an outcome (or nothing) back.

use crate::context::SyncContext;
use crate::coordinator::ApplicationCoordinator;
use crate::error::{ErrorKind, Result};
use crate::event::{EventBus, SyncEvent};
use crate::hold::{HoldGuard, HoldKind};
use crate::permission::{Pairing, PairingSource, PermissionSet};
use crate::session::{RestrictedState, RevertReason, SessionOutcome};
use exn::ResultExt;
use mirage_model::{PeerId, Snapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct Presence {
    online: bool,
    visible: bool,
}

/// A paired peer.
pub struct Peer {
    id: PeerId,
    coordinator: Arc<ApplicationCoordinator>,
    pairing: Mutex<Pairing>,
    presence: Mutex<Presence>,
    /// Last snapshot received, before any content was stripped.
    received: Mutex<Option<Snapshot>>,
}

impl Peer {
    fn new(id: PeerId, context: SyncContext) -> Self {
        Self {
            coordinator: ApplicationCoordinator::new(id.clone(), context),
            id,
            pairing: Mutex::new(Pairing::default()),
            presence: Mutex::new(Presence { online: true, visible: true }),
            received: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn coordinator(&self) -> &Arc<ApplicationCoordinator> {
        &self.coordinator
    }

    pub fn pairing(&self) -> Pairing {
        self.pairing.lock().clone()
    }

    pub fn permissions(&self) -> PermissionSet {
        self.pairing.lock().effective()
    }

    pub fn is_online(&self) -> bool {
        self.presence.lock().online
    }

    pub fn is_visible(&self) -> bool {
        self.presence.lock().visible
    }

    fn is_present(&self) -> bool {
        let presence = *self.presence.lock();
        presence.online && presence.visible
    }

    /// The last snapshot received, with disallowed content removed.
    fn permitted_snapshot(&self) -> Option<Snapshot> {
        let permissions = self.permissions();
        if permissions.paused {
            return None;
        }
        let snapshot = self.received.lock().clone()?;
        match strip(snapshot, &permissions) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                tracing::warn!(peer = %self.id, ?error, "dropping snapshot");
                None
            },
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("presence", &*self.presence.lock())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

fn strip(snapshot: Snapshot, permissions: &PermissionSet) -> Result<Snapshot> {
    let denied = permissions.denied_categories();
    if denied.is_empty() {
        return Ok(snapshot);
    }
    snapshot.to_builder().strip_categories(&denied).finalize().or_raise(|| ErrorKind::InvalidSnapshot)
}

/// Owns all known peers.
///
/// Peers come into existence with their first pairing and go away, reverted,
/// when their last pairing is removed.
pub struct PeerRegistry {
    context: SyncContext,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new(context: SyncContext) -> Self {
        Self { context, peers: RwLock::new(HashMap::new()) }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().cloned().collect()
    }

    fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Adds or updates one source of pairing with `id`.
    ///
    /// Pausing reverts the peer; anything else that changes the effective
    /// permissions re-applies the last snapshot received.
    pub async fn register_pairing(
        &self,
        id: PeerId,
        source: PairingSource,
        permissions: PermissionSet,
    ) -> Option<JoinHandle<SessionOutcome>> {
        let peer = self
            .peers
            .write()
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!(peer = %id, "peer registered");
                Arc::new(Peer::new(id.clone(), self.context.clone()))
            })
            .clone();
        let (before, after) = {
            let mut pairing = peer.pairing.lock();
            let before = pairing.effective();
            pairing.set(source, permissions);
            (before, pairing.effective())
        };
        self.permissions_changed(&peer, before, after).await
    }

    /// Removes one source of pairing. The peer is disposed once none remain.
    ///
    /// Returns `false` if there was no such pairing.
    pub async fn unregister_pairing(&self, id: &PeerId, source: &PairingSource) -> bool {
        let Some(peer) = self.peer(id) else {
            return false;
        };
        let (removed, before, after, unpaired) = {
            let mut pairing = peer.pairing.lock();
            let before = pairing.effective();
            let removed = pairing.remove(source);
            (removed, before, pairing.effective(), pairing.is_empty())
        };
        if !removed {
            return false;
        }
        if unpaired {
            self.peers.write().remove(id);
            tracing::debug!(peer = %id, "peer unregistered");
            peer.coordinator.dispose().await;
        } else {
            _ = self.permissions_changed(&peer, before, after).await;
        }
        true
    }

    async fn permissions_changed(
        &self,
        peer: &Arc<Peer>,
        before: PermissionSet,
        after: PermissionSet,
    ) -> Option<JoinHandle<SessionOutcome>> {
        if before == after {
            return None;
        }
        if after.paused {
            if !before.paused {
                _ = peer.coordinator.revert(RevertReason::Paused).await;
            }
            return None;
        }
        self.reapply(peer)
    }

    /// Forces the peer's last snapshot through its coordinator again,
    /// re-stripped under the current permissions.
    fn reapply(&self, peer: &Peer) -> Option<JoinHandle<SessionOutcome>> {
        if !peer.is_present() {
            return None;
        }
        let snapshot = peer.permitted_snapshot()?;
        Some(peer.coordinator.receive(snapshot, true))
    }

    /// Hands a snapshot pushed by the transport to the peer's coordinator,
    /// minus any content category the pairing disallows.
    ///
    /// Returns `None` when the snapshot was only stored: unknown, paused,
    /// offline or invisible peers don't start sessions.
    pub fn receive_snapshot(&self, id: &PeerId, snapshot: Snapshot) -> Option<JoinHandle<SessionOutcome>> {
        let Some(peer) = self.peer(id) else {
            tracing::debug!(peer = %id, "ignoring snapshot from unpaired peer");
            return None;
        };
        tracing::debug!(peer = %id, hash = %snapshot.content_hash(), "snapshot received");
        *peer.received.lock() = Some(snapshot);
        if !peer.is_present() {
            tracing::debug!(peer = %id, "peer not present, snapshot kept for later");
            return None;
        }
        let snapshot = peer.permitted_snapshot()?;
        Some(peer.coordinator.receive(snapshot, false))
    }

    /// Losing visibility reverts the peer; regaining it re-applies the last
    /// snapshot received.
    pub async fn set_visible(&self, id: &PeerId, visible: bool) -> Option<JoinHandle<SessionOutcome>> {
        let peer = self.peer(id)?;
        let was = std::mem::replace(&mut peer.presence.lock().visible, visible);
        if was == visible {
            return None;
        }
        if visible {
            return self.reapply(&peer);
        }
        _ = peer.coordinator.revert(RevertReason::VisibilityLost).await;
        None
    }

    pub async fn set_online(&self, id: &PeerId, online: bool) -> Option<JoinHandle<SessionOutcome>> {
        let peer = self.peer(id)?;
        let was = std::mem::replace(&mut peer.presence.lock().online, online);
        if was == online {
            return None;
        }
        if online {
            tracing::info!(peer = %id, "peer online");
            self.context.events.publish(SyncEvent::PeerOnline(id.clone()));
            return self.reapply(&peer);
        }
        tracing::info!(peer = %id, "peer offline");
        self.context.events.publish(SyncEvent::PeerOffline(id.clone()));
        _ = peer.coordinator.revert(RevertReason::Offline).await;
        None
    }

    /// Places a named hold on a peer. `None` if the peer isn't known.
    pub fn hold(&self, id: &PeerId, kind: HoldKind, reason: impl Into<String>, max: u32) -> Option<HoldGuard> {
        Some(self.peer(id)?.coordinator.holds().acquire(kind, reason, max))
    }

    pub fn hold_reasons(&self, id: &PeerId) -> Vec<String> {
        self.peer(id).map(|peer| peer.coordinator.holds().reasons()).unwrap_or_default()
    }

    /// Re-drives every peer parked waiting for its target.
    pub fn target_ready(&self) -> Vec<JoinHandle<SessionOutcome>> {
        self.all().iter().filter_map(|peer| peer.coordinator.target_ready()).collect()
    }

    /// The local player started changing zones: every session is cancelled,
    /// downloads included.
    pub fn zone_transition_started(&self) {
        for peer in self.all() {
            peer.coordinator.cancel_sessions();
        }
    }

    pub fn restricted_state_started(&self, state: RestrictedState) {
        tracing::debug!(%state, "restricted state started");
        for peer in self.all() {
            peer.coordinator.restricted_state_started(state);
        }
    }

    pub fn restricted_state_ended(&self, state: RestrictedState) -> Vec<JoinHandle<SessionOutcome>> {
        tracing::debug!(%state, "restricted state ended");
        self.all().iter().filter_map(|peer| peer.coordinator.restricted_state_ended(state)).collect()
    }

    /// Disposes every peer.
    pub async fn shutdown(&self) {
        let peers: Vec<_> = self.peers.write().drain().map(|(_, peer)| peer).collect();
        tracing::info!(peers = peers.len(), "shutting down");
        futures::future::join_all(peers.iter().map(|peer| peer.coordinator.dispose())).await;
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry").field("peers", &self.peer_ids()).finish_non_exhaustive()
    }
}
