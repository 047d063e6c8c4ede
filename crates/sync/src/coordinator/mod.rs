//! The per-peer application pipeline.
//!
//! Every snapshot received for a peer starts a session: diff against the
//! last applied baseline, check holds, wait for the target, download what's
//! missing, check resource thresholds, then apply each changed capability
//! through its adapter. A newer snapshot supersedes the running session, but
//! only ever cancels its application half; downloads already under way keep
//! going and land in the shared store for whoever needs them next.
//!
//! At most one session per peer is inside the apply phase at a time, and a
//! revert always finishes (or times out) before the next apply may start.

mod apply;
mod session;

use crate::context::SyncContext;
use crate::error::{ErrorKind, Result};
use crate::event::SyncEvent;
use crate::hold::{HoldGuard, HoldRegistry};
use crate::session::{Phase, RestrictedState, RevertReason, SessionId, SessionOutcome};
use mirage_model::{Capability, ContentHash, ObjectKind, PeerId, Snapshot};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) const THRESHOLD_HOLD_REASON: &str = "resource threshold exceeded";

/// The session currently owning the peer's pipeline.
struct CurrentSession {
    id: SessionId,
    download: CancellationToken,
    apply: CancellationToken,
}

/// A session that stopped because the target wasn't ready.
#[derive(Debug, Clone, Copy)]
struct Deferral {
    session: SessionId,
    /// Set once a readiness notification has re-run the session.
    retrying: bool,
}

struct PeerState {
    phase: Phase,
    last_received: Option<Snapshot>,
    /// What the target currently shows, or should show once holds clear.
    baseline: Option<Snapshot>,
    /// The target may not match the baseline; the next diff is forced.
    dirty: bool,
    applied: BTreeMap<ObjectKind, BTreeSet<Capability>>,
    current: Option<CurrentSession>,
    /// Parent of every session token. Replaced whenever all sessions are
    /// cancelled, so later sessions start from a live token.
    generation: CancellationToken,
    deferred: Option<Deferral>,
    buffered: Option<(Snapshot, bool)>,
    restricted: BTreeSet<RestrictedState>,
    notified_unavailable: BTreeSet<Capability>,
    threshold_hold: Option<HoldGuard>,
    /// Snapshot whose threshold breach was released, and may apply anyway.
    threshold_accepted: Option<ContentHash>,
    reverting: usize,
    disposed: bool,
}

impl PeerState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_received: None,
            baseline: None,
            dirty: false,
            applied: BTreeMap::new(),
            current: None,
            generation: CancellationToken::new(),
            deferred: None,
            buffered: None,
            restricted: BTreeSet::new(),
            notified_unavailable: BTreeSet::new(),
            threshold_hold: None,
            threshold_accepted: None,
            reverting: 0,
            disposed: false,
        }
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.current.as_ref().is_some_and(|current| current.id == id)
    }

    fn cancel_generation(&mut self) {
        self.generation.cancel();
        self.generation = CancellationToken::new();
        self.current = None;
    }
}

/// One unit of work started by [`ApplicationCoordinator::receive`].
pub(crate) struct Session {
    id: SessionId,
    snapshot: Snapshot,
    force: bool,
    download: CancellationToken,
    apply: CancellationToken,
}

/// Owns everything the local client does to one remote peer's appearance.
pub struct ApplicationCoordinator {
    peer: PeerId,
    context: SyncContext,
    holds: HoldRegistry,
    state: Mutex<PeerState>,
    slot: apply::ApplySlot,
}

impl ApplicationCoordinator {
    /// Creates a coordinator whose holds replay the peer's baseline as soon
    /// as the last one is released.
    pub fn new(peer: PeerId, context: SyncContext) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let holds = HoldRegistry::new(peer.clone(), context.events.clone());
            let weak = this.clone();
            holds.set_replay_hook(move || {
                if let Some(coordinator) = weak.upgrade() {
                    _ = coordinator.replay();
                }
            });
            Self { peer, context, holds, state: Mutex::new(PeerState::new()), slot: apply::ApplySlot::default() }
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn holds(&self) -> &HoldRegistry {
        &self.holds
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn baseline(&self) -> Option<Snapshot> {
        self.state.lock().baseline.clone()
    }

    pub fn last_received(&self) -> Option<Snapshot> {
        self.state.lock().last_received.clone()
    }

    /// Capabilities currently applied to the peer's objects.
    pub fn applied(&self) -> BTreeMap<ObjectKind, BTreeSet<Capability>> {
        self.state.lock().applied.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Starts a session for `snapshot`, superseding whatever is running.
    ///
    /// `force` redoes every capability the snapshot carries instead of only
    /// the ones that changed.
    pub fn receive(self: &Arc<Self>, snapshot: Snapshot, force: bool) -> JoinHandle<SessionOutcome> {
        self.start(snapshot, force, None)
    }

    /// Forces the baseline (or the last snapshot received) through the
    /// pipeline again.
    pub fn replay(self: &Arc<Self>) -> Option<JoinHandle<SessionOutcome>> {
        let snapshot = {
            let state = self.state.lock();
            if state.disposed {
                return None;
            }
            state.baseline.clone().or_else(|| state.last_received.clone())?
        };
        tracing::debug!(peer = %self.peer, "replaying snapshot");
        Some(self.receive(snapshot, true))
    }

    /// Re-runs the session that stopped waiting for the target, once.
    pub fn target_ready(self: &Arc<Self>) -> Option<JoinHandle<SessionOutcome>> {
        let (session, snapshot) = {
            let mut state = self.state.lock();
            let snapshot = state.last_received.clone()?;
            let deferral = state.deferred.as_mut().filter(|deferral| !deferral.retrying)?;
            deferral.retrying = true;
            (deferral.session, snapshot)
        };
        tracing::debug!(peer = %self.peer, %session, "target ready, resuming session");
        Some(self.start(snapshot, false, Some(session)))
    }

    /// Cancels every session of this peer, including downloads, because the
    /// target went away. The last snapshot received is resumed by the next
    /// [`target_ready`](Self::target_ready).
    pub fn cancel_sessions(&self) {
        let mut state = self.state.lock();
        let interrupted = state.current.is_some() || state.deferred.is_some();
        state.cancel_generation();
        if state.disposed || state.last_received.is_none() || !interrupted {
            return;
        }
        // A fresh id, so the cancelled session finishing doesn't clear it.
        let session = SessionId::next();
        state.deferred = Some(Deferral { session, retrying: false });
        state.phase = Phase::PendingTargetReady;
        tracing::debug!(peer = %self.peer, %session, "session waiting for the target");
    }

    /// The local player entered a restricted state. A session that hasn't
    /// begun applying is cancelled and its snapshot buffered.
    pub fn restricted_state_started(&self, restricted: RestrictedState) {
        let mut state = self.state.lock();
        state.restricted.insert(restricted);
        if !self.is_deferring(&state) || state.phase == Phase::Applying {
            return;
        }
        if let Some(current) = state.current.take() {
            current.download.cancel();
            current.apply.cancel();
            if let Some(snapshot) = state.last_received.clone() {
                state.buffered = Some((snapshot, false));
            }
            tracing::debug!(peer = %self.peer, session = %current.id, %restricted, "session deferred");
        }
    }

    /// The local player left a restricted state. Once none remain, the
    /// buffered snapshot (if any) is received again.
    pub fn restricted_state_ended(self: &Arc<Self>, restricted: RestrictedState) -> Option<JoinHandle<SessionOutcome>> {
        let (snapshot, force) = {
            let mut state = self.state.lock();
            state.restricted.remove(&restricted);
            if self.is_deferring(&state) {
                return None;
            }
            state.buffered.take()?
        };
        Some(self.receive(snapshot, force))
    }

    /// Releases the hold taken when a snapshot exceeded resource thresholds,
    /// accepting the held baseline despite its size. Returns `true` if that
    /// triggered a replay.
    pub fn release_threshold_hold(&self) -> bool {
        let guard = {
            let mut state = self.state.lock();
            let guard = state.threshold_hold.take();
            if guard.is_some() {
                state.threshold_accepted = state.baseline.as_ref().map(|baseline| baseline.content_hash().clone());
            }
            guard
        };
        guard.is_some_and(HoldGuard::release)
    }

    /// Undoes everything applied to the peer and forgets the baseline.
    ///
    /// Every session is cancelled first. The revert itself waits for the
    /// apply slot and is bounded by the revert timeout; an adapter still
    /// running when it expires is told to stop through its token.
    pub async fn revert(&self, reason: RevertReason) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            state.cancel_generation();
            state.deferred = None;
            state.buffered = None;
            state.reverting += 1;
            state.phase = Phase::Reverting;
        }
        tracing::debug!(peer = %self.peer, %reason, "reverting");
        let timeout = self.context.settings.revert_timeout;
        let result = match tokio::time::timeout(timeout, self.revert_applied(&token)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(exn::Exn::from(ErrorKind::RevertTimedOut))
            },
        };
        {
            let mut state = self.state.lock();
            state.reverting = state.reverting.saturating_sub(1);
            state.applied.clear();
            state.baseline = None;
            state.threshold_accepted = None;
            state.dirty = false;
            state.notified_unavailable.clear();
            state.phase = if state.disposed { Phase::Disposed } else { Phase::Idle };
        }
        match &result {
            Ok(()) => tracing::info!(peer = %self.peer, %reason, "reverted"),
            Err(error) => tracing::warn!(peer = %self.peer, %reason, ?error, "revert incomplete"),
        }
        self.context.events.publish(SyncEvent::Reverted { peer: self.peer.clone(), reason });
        result
    }

    /// Reverts and stops accepting snapshots for good.
    pub async fn dispose(&self) {
        let threshold_hold = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.threshold_hold.take()
        };
        if let Some(guard) = threshold_hold {
            guard.release_without_replay();
        }
        // Already logged.
        _ = self.revert(RevertReason::Disposed).await;
    }

    fn is_deferring(&self, state: &PeerState) -> bool {
        let settings = &self.context.settings;
        state.restricted.iter().any(|restricted| match restricted {
            RestrictedState::Combat => settings.defer_in_combat,
            RestrictedState::Performance => settings.defer_in_performance,
        })
    }

    fn start(self: &Arc<Self>, snapshot: Snapshot, force: bool, reuse: Option<SessionId>) -> JoinHandle<SessionOutcome> {
        match self.begin(snapshot, force, reuse) {
            Ok(session) => {
                let this = self.clone();
                self.context.runtime.spawn(async move { this.run(session).await })
            },
            Err((id, outcome)) => {
                self.finish(id, &outcome);
                self.context.runtime.spawn(std::future::ready(outcome))
            },
        }
    }

    fn begin(
        &self,
        snapshot: Snapshot,
        force: bool,
        reuse: Option<SessionId>,
    ) -> std::result::Result<Session, (SessionId, SessionOutcome)> {
        let id = reuse.unwrap_or_else(SessionId::next);
        let mut state = self.state.lock();
        if state.disposed {
            return Err((id, SessionOutcome::Ignored));
        }
        state.last_received = Some(snapshot.clone());
        if self.is_deferring(&state) {
            let force = force || state.buffered.as_ref().is_some_and(|(_, buffered)| *buffered);
            state.buffered = Some((snapshot, force));
            if state.phase != Phase::Applying
                && let Some(current) = state.current.take()
            {
                current.download.cancel();
                current.apply.cancel();
            }
            return Err((id, SessionOutcome::Deferred));
        }
        if let Some(previous) = state.current.take() {
            tracing::debug!(peer = %self.peer, superseded = %previous.id, by = %id, "superseding session");
            previous.apply.cancel();
        }
        let session = Session {
            id,
            snapshot,
            force,
            download: state.generation.child_token(),
            apply: state.generation.child_token(),
        };
        state.current =
            Some(CurrentSession { id, download: session.download.clone(), apply: session.apply.clone() });
        Ok(session)
    }

    async fn run(self: Arc<Self>, session: Session) -> SessionOutcome {
        let outcome = self.pipeline(&session).await;
        self.finish(session.id, &outcome);
        outcome
    }

    fn finish(&self, id: SessionId, outcome: &SessionOutcome) {
        {
            let mut state = self.state.lock();
            let finished_deferral = state.deferred.is_some_and(|deferral| {
                matches!(outcome, SessionOutcome::Applied(_))
                    || (deferral.session == id && *outcome != SessionOutcome::PendingTarget)
            });
            if finished_deferral {
                state.deferred = None;
            }
            if state.is_current(id) {
                state.current = None;
                if matches!(outcome, SessionOutcome::Cancelled | SessionOutcome::Superseded) {
                    state.phase = Phase::Cancelled;
                }
            }
        }
        match outcome {
            SessionOutcome::Applied(_) | SessionOutcome::ContentUnavailable(_) | SessionOutcome::TargetInvalidated => {
                tracing::info!(peer = %self.peer, session = %id, %outcome, "session finished");
            },
            SessionOutcome::ThresholdExceeded(_) => {
                tracing::warn!(peer = %self.peer, session = %id, %outcome, "session finished");
            },
            _ => tracing::debug!(peer = %self.peer, session = %id, %outcome, "session finished"),
        }
        self.context.events.publish(SyncEvent::SessionFinished {
            peer: self.peer.clone(),
            session: id,
            outcome: outcome.clone(),
        });
    }

    /// Updates the phase, unless a newer session has taken over.
    fn set_phase(&self, id: SessionId, phase: Phase) {
        let mut state = self.state.lock();
        if state.is_current(id) {
            state.phase = phase;
        }
    }
}

impl std::fmt::Debug for ApplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ApplicationCoordinator")
            .field("peer", &self.peer)
            .field("phase", &state.phase)
            .field("dirty", &state.dirty)
            .field("applied", &state.applied)
            .finish_non_exhaustive()
    }
}
