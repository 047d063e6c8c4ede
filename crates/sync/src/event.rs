use crate::session::{RevertReason, SessionId, SessionOutcome};
use mirage_model::{Capability, PeerId};
use std::collections::BTreeSet;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Everything observers can hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The set of active holds for a peer changed.
    HoldsChanged { peer: PeerId, reasons: Vec<String> },
    /// Sent once per peer per distinct set of missing adapters.
    CapabilitiesUnavailable { peer: PeerId, capabilities: BTreeSet<Capability> },
    SessionFinished { peer: PeerId, session: SessionId, outcome: SessionOutcome },
    Reverted { peer: PeerId, reason: RevertReason },
    PeerOnline(PeerId),
    PeerOffline(PeerId),
}

/// Broadcasts [`SyncEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails: with nobody listening, events
/// are dropped, and slow subscribers lose the oldest events first.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!(?event, "publishing event");
        _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
