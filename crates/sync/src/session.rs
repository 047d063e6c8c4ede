use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identifies one application attempt. Unique for the lifetime of the
/// process, across all peers.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Where a peer's coordinator currently is.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Waiting for the target to become resolvable.
    PendingTargetReady,
    Diffed,
    Downloading,
    ReadyToApply,
    Applying,
    Applied,
    /// A hold stopped the last session before it could apply.
    Held,
    Cancelled,
    Reverting,
    Disposed,
}

/// How a session ended.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    #[display("applied {_0} capability changes")]
    Applied(usize),
    #[display("nothing changed")]
    NoChanges,
    /// A download hold is active; the snapshot became the baseline only.
    #[display("download held")]
    DownloadHeld,
    #[display("application held")]
    ApplicationHeld,
    #[display("resource threshold exceeded: {_0}")]
    ThresholdExceeded(String),
    #[display("{_0} files still missing")]
    ContentUnavailable(usize),
    #[display("waiting for target")]
    PendingTarget,
    /// Buffered until the local player leaves a restricted state.
    #[display("deferred")]
    Deferred,
    #[display("target invalidated")]
    TargetInvalidated,
    #[display("superseded by a newer snapshot")]
    Superseded,
    #[display("cancelled")]
    Cancelled,
    /// The peer is disposed or paused.
    #[display("ignored")]
    Ignored,
}

/// A local player state that may defer applying other peers' appearance.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestrictedState {
    Combat,
    Performance,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RevertReason {
    #[display("visibility lost")]
    VisibilityLost,
    #[display("peer went offline")]
    Offline,
    #[display("pairing paused")]
    Paused,
    #[display("requested")]
    Requested,
    #[display("disposed")]
    Disposed,
}
