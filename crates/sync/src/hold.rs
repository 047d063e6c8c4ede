//! Reference-counted, named gates in front of a peer's pipeline.
//!
//! A download hold stops a peer's sessions before anything is fetched; an
//! application hold lets content download but stops it from being applied.
//! Download holds imply application holds.

use crate::event::{EventBus, SyncEvent};
use derive_more::Display;
use mirage_model::PeerId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HoldKind {
    #[display("download")]
    Download,
    #[display("application")]
    Application,
}

type ReplayHook = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    peer: PeerId,
    counters: Mutex<BTreeMap<(HoldKind, String), u32>>,
    events: EventBus,
    replay: Mutex<Option<ReplayHook>>,
}

/// The holds of one peer.
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct HoldRegistry {
    shared: Arc<Shared>,
}

impl HoldRegistry {
    pub fn new(peer: PeerId, events: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                counters: Mutex::new(BTreeMap::new()),
                events,
                replay: Mutex::new(None),
            }),
        }
    }

    /// Called whenever releasing a hold leaves the peer with no holds at all.
    pub fn set_replay_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.replay.lock() = Some(Arc::new(hook));
    }

    /// Takes a hold, incrementing the named counter up to `max`.
    ///
    /// A counter already at `max` stays there and the returned guard doesn't
    /// own a count: dropping it changes nothing.
    pub fn acquire(&self, kind: HoldKind, reason: impl Into<String>, max: u32) -> HoldGuard {
        let reason = reason.into();
        let (counted, reasons) = {
            let mut counters = self.shared.counters.lock();
            let count = counters.entry((kind, reason.clone())).or_insert(0);
            let counted = *count < max.max(1);
            if counted {
                *count += 1;
            }
            (counted, describe(&counters))
        };
        if counted {
            tracing::debug!(peer = %self.shared.peer, %kind, %reason, "hold acquired");
            self.publish(reasons);
        }
        HoldGuard { registry: self.clone(), kind, reason, counted }
    }

    /// Returns `true` if this release triggered a replay.
    fn release(&self, kind: HoldKind, reason: &str, replay: bool) -> bool {
        let (cleared, reasons) = {
            let mut counters = self.shared.counters.lock();
            let key = (kind, reason.to_string());
            let Some(count) = counters.get_mut(&key) else {
                return false;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.remove(&key);
            }
            (counters.is_empty(), describe(&counters))
        };
        tracing::debug!(peer = %self.shared.peer, %kind, %reason, "hold released");
        self.publish(reasons);
        if !(cleared && replay) {
            return false;
        }
        let hook = self.shared.replay.lock().clone();
        match hook {
            Some(hook) => {
                hook();
                true
            },
            None => false,
        }
    }

    pub fn is_download_held(&self) -> bool {
        self.shared.counters.lock().keys().any(|(kind, _)| *kind == HoldKind::Download)
    }

    /// Any hold at all, since download holds imply application holds.
    pub fn is_application_held(&self) -> bool {
        !self.shared.counters.lock().is_empty()
    }

    pub fn count(&self, kind: HoldKind, reason: &str) -> u32 {
        self.shared.counters.lock().get(&(kind, reason.to_string())).copied().unwrap_or(0)
    }

    /// Active holds, human readable.
    pub fn reasons(&self) -> Vec<String> {
        describe(&self.shared.counters.lock())
    }

    fn publish(&self, reasons: Vec<String>) {
        self.shared.events.publish(SyncEvent::HoldsChanged { peer: self.shared.peer.clone(), reasons });
    }
}

fn describe(counters: &BTreeMap<(HoldKind, String), u32>) -> Vec<String> {
    counters
        .iter()
        .map(|((kind, reason), count)| match count {
            1 => format!("{kind} hold: {reason}"),
            n => format!("{kind} hold: {reason} (x{n})"),
        })
        .collect()
}

/// An active hold. Released when dropped, replaying the peer's snapshot if
/// it was the last one.
#[must_use = "the hold is released as soon as the guard is dropped"]
pub struct HoldGuard {
    registry: HoldRegistry,
    kind: HoldKind,
    reason: String,
    counted: bool,
}

impl HoldGuard {
    pub fn kind(&self) -> HoldKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Releases the hold now. Returns `true` if a replay was triggered.
    pub fn release(mut self) -> bool {
        self.finish(true)
    }

    /// Releases the hold without replaying, even if it was the last one.
    pub fn release_without_replay(mut self) -> bool {
        self.finish(false)
    }

    fn finish(&mut self, replay: bool) -> bool {
        if !std::mem::take(&mut self.counted) {
            return false;
        }
        self.registry.release(self.kind, &self.reason, replay)
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl std::fmt::Debug for HoldGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldGuard")
            .field("kind", &self.kind)
            .field("reason", &self.reason)
            .field("counted", &self.counted)
            .finish()
    }
}
