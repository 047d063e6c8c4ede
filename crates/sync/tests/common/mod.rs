#![allow(dead_code)]

use mirage_cache::{ContentStore, Database};
use mirage_model::{Capability, ContentHash, FileReplacement, ObjectKind, PeerId, Snapshot, SnapshotBuilder};
use mirage_storage::backend::MockBackend;
use mirage_sync::mock::{CallLog, MockTarget, RecordingAdapter};
use mirage_sync::{
    AdapterSet, ApplicationSettings, PairingSource, PeerRegistry, PermissionSet, SyncContext, SyncEvent,
};
use mirage_transfer::{MockRemote, TransferOrchestrator, TransferSettings};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Application settings with every delay shrunk to a few milliseconds.
pub fn fast() -> ApplicationSettings {
    ApplicationSettings {
        poll_interval: Duration::from_millis(5),
        transition_timeout: Duration::from_millis(200),
        revert_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(5),
        ..ApplicationSettings::default()
    }
}

pub struct Harness {
    pub registry: PeerRegistry,
    pub store: Arc<ContentStore>,
    pub remote: Arc<MockRemote>,
    pub target: Arc<MockTarget>,
    pub log: CallLog,
    pub adapters: BTreeMap<Capability, Arc<RecordingAdapter>>,
    pub events: broadcast::Receiver<SyncEvent>,
    pub peer: PeerId,
}

impl Harness {
    /// A registry with one directly paired, drawn peer and a recording
    /// adapter for every capability.
    pub async fn new(settings: ApplicationSettings) -> Self {
        Self::build(settings, |adapter| adapter).await
    }

    pub async fn build(
        settings: ApplicationSettings,
        customize: impl Fn(RecordingAdapter) -> RecordingAdapter,
    ) -> Self {
        let database = Database::connect_in_memory().await.unwrap();
        let store = Arc::new(ContentStore::open(Arc::new(MockBackend::default()), None, &database));
        let remote = Arc::new(MockRemote::new());
        let transfer = Arc::new(TransferOrchestrator::new(store.clone(), remote.clone(), TransferSettings::default()));

        let log = CallLog::new();
        let mut set = AdapterSet::new();
        let mut adapters = BTreeMap::new();
        for capability in Capability::ALL {
            let adapter = Arc::new(customize(RecordingAdapter::new(capability, log.clone())));
            set.insert(adapter.clone());
            adapters.insert(capability, adapter);
        }

        let target = Arc::new(MockTarget::new());
        let context = SyncContext::new(transfer, set, target.clone(), settings);
        let events = context.events.subscribe();
        let registry = PeerRegistry::new(context);

        let peer = PeerId::new("peer-b");
        target.show(&peer, ObjectKind::Player);
        _ = registry.register_pairing(peer.clone(), PairingSource::Direct, PermissionSet::default()).await;

        Self { registry, store, remote, target, log, adapters, events, peer }
    }

    pub fn adapter(&self, capability: Capability) -> &Arc<RecordingAdapter> {
        &self.adapters[&capability]
    }

    /// Drains every event published so far.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn player_file(path: &str, hash: &ContentHash) -> FileReplacement {
    FileReplacement::with_hash([path], hash.clone()).unwrap()
}

pub fn snapshot_with_file(hash: &ContentHash) -> Snapshot {
    SnapshotBuilder::new().file(ObjectKind::Player, player_file("chara/body.tex", hash)).finalize().unwrap()
}

pub fn snapshot_with_title(title: &str) -> Snapshot {
    SnapshotBuilder::new().blob(ObjectKind::Player, Capability::Title, title).finalize().unwrap()
}
