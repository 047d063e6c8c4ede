//! In-memory adapters and targets for exercising coordinators.

use crate::adapter::{Affinity, ApplyRequest, CapabilityAdapter, Payload, RevertRequest};
use crate::error::{ErrorKind, Result};
use crate::session::SessionId;
use crate::target::{TargetHandle, TargetProvider};
use async_trait::async_trait;
use mirage_model::{Capability, ObjectKind, PeerId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One call an adapter received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Apply { peer: PeerId, session: SessionId, kind: ObjectKind, capability: Capability, payload: Payload },
    Revert { peer: PeerId, session: SessionId, kind: ObjectKind, capability: Capability },
    ReleaseScope { peer: PeerId, capability: Capability },
}

impl Recorded {
    pub fn is_apply(&self) -> bool {
        matches!(self, Self::Apply { .. })
    }

    pub fn is_revert(&self) -> bool {
        matches!(self, Self::Revert { .. })
    }
}

#[derive(Default)]
struct LogState {
    calls: Vec<Recorded>,
    /// Calls currently inside an adapter, per peer and session.
    active: HashMap<PeerId, BTreeMap<SessionId, usize>>,
    overlaps: usize,
}

/// Shared record of every call made to a set of [`RecordingAdapter`]s.
///
/// Also notices when calls from two different sessions of the same peer are
/// inside adapters at the same time.
#[derive(Clone, Default)]
pub struct CallLog {
    state: Arc<Mutex<LogState>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.state.lock().calls.clone()
    }

    pub fn applies(&self) -> Vec<Recorded> {
        self.calls().into_iter().filter(Recorded::is_apply).collect()
    }

    pub fn reverts(&self) -> Vec<Recorded> {
        self.calls().into_iter().filter(Recorded::is_revert).collect()
    }

    pub fn apply_count(&self) -> usize {
        self.state.lock().calls.iter().filter(|call| call.is_apply()).count()
    }

    /// Times a session entered an adapter while another session of the same
    /// peer was still inside one.
    pub fn overlaps(&self) -> usize {
        self.state.lock().overlaps
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    fn enter(&self, peer: &PeerId, session: SessionId, call: Recorded) -> ActiveCall {
        let mut state = self.state.lock();
        state.calls.push(call);
        let sessions = state.active.entry(peer.clone()).or_default();
        let overlapping = sessions.keys().any(|active| *active != session);
        *sessions.entry(session).or_insert(0) += 1;
        if overlapping {
            state.overlaps += 1;
        }
        ActiveCall { log: self.clone(), peer: peer.clone(), session }
    }
}

struct ActiveCall {
    log: CallLog,
    peer: PeerId,
    session: SessionId,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        let mut state = self.log.state.lock();
        if let Some(sessions) = state.active.get_mut(&self.peer) {
            if let Some(count) = sessions.get_mut(&self.session) {
                *count -= 1;
                if *count == 0 {
                    sessions.remove(&self.session);
                }
            }
            if sessions.is_empty() {
                state.active.remove(&self.peer);
            }
        }
    }
}

/// An adapter that records its calls and can be told to be slow, fail or
/// disappear.
pub struct RecordingAdapter {
    capability: Capability,
    log: CallLog,
    affinity: Affinity,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    available: AtomicBool,
}

impl RecordingAdapter {
    pub fn new(capability: Capability, log: CallLog) -> Self {
        Self {
            capability,
            log,
            affinity: Affinity::Any,
            delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    async fn work(&self, token: &CancellationToken) -> Result<()> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                () = tokio::time::sleep(delay) => {},
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::AdapterFailure(self.capability));
        }
        Ok(())
    }
}

#[async_trait]
impl CapabilityAdapter for RecordingAdapter {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn affinity(&self) -> Affinity {
        self.affinity
    }

    async fn apply(&self, request: &ApplyRequest, token: &CancellationToken) -> Result<()> {
        let _active = self.log.enter(&request.peer, request.session, Recorded::Apply {
            peer: request.peer.clone(),
            session: request.session,
            kind: request.kind,
            capability: self.capability,
            payload: request.payload.clone(),
        });
        self.work(token).await
    }

    async fn revert(&self, request: &RevertRequest, token: &CancellationToken) -> Result<()> {
        let _active = self.log.enter(&request.peer, request.session, Recorded::Revert {
            peer: request.peer.clone(),
            session: request.session,
            kind: request.kind,
            capability: self.capability,
        });
        self.work(token).await
    }

    async fn release_scope(&self, peer: &PeerId, _token: &CancellationToken) -> Result<()> {
        self.log.state.lock().calls.push(Recorded::ReleaseScope { peer: peer.clone(), capability: self.capability });
        Ok(())
    }
}

/// Game state for tests: which peer objects are drawn, and whether the
/// local player is between zones.
#[derive(Default)]
pub struct MockTarget {
    drawn: Mutex<HashMap<(PeerId, ObjectKind), TargetHandle>>,
    invalid: Mutex<HashSet<TargetHandle>>,
    transitioning: AtomicBool,
    next: AtomicU64,
}

impl MockTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the object, returning its (new) handle.
    pub fn show(&self, peer: &PeerId, kind: ObjectKind) -> TargetHandle {
        let handle = TargetHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.drawn.lock().insert((peer.clone(), kind), handle);
        handle
    }

    pub fn hide(&self, peer: &PeerId, kind: ObjectKind) {
        if let Some(handle) = self.drawn.lock().remove(&(peer.clone(), kind)) {
            self.invalid.lock().insert(handle);
        }
    }

    /// Keeps the object drawn but makes earlier handles to it stale.
    pub fn invalidate(&self, handle: TargetHandle) {
        self.invalid.lock().insert(handle);
    }

    pub fn set_transitioning(&self, transitioning: bool) {
        self.transitioning.store(transitioning, Ordering::SeqCst);
    }
}

impl TargetProvider for MockTarget {
    fn resolve(&self, peer: &PeerId, kind: ObjectKind) -> Option<TargetHandle> {
        self.drawn.lock().get(&(peer.clone(), kind)).copied()
    }

    fn is_transitioning(&self) -> bool {
        self.transitioning.load(Ordering::SeqCst)
    }

    fn is_valid(&self, handle: TargetHandle) -> bool {
        !self.invalid.lock().contains(&handle)
    }
}
