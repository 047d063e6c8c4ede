use crate::adapter::AdapterSet;
use crate::event::EventBus;
use crate::executor::TargetExecutor;
use crate::settings::ApplicationSettings;
use crate::target::TargetProvider;
use mirage_transfer::TransferOrchestrator;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Everything the coordinators of all peers share.
#[derive(Clone)]
pub struct SyncContext {
    pub transfer: Arc<TransferOrchestrator>,
    pub adapters: Arc<AdapterSet>,
    pub target: Arc<dyn TargetProvider>,
    pub executor: TargetExecutor,
    pub events: EventBus,
    pub settings: Arc<ApplicationSettings>,
    /// Sessions are spawned here, whichever thread delivers the snapshot.
    pub runtime: Handle,
}

impl SyncContext {
    /// Spawns the target executor, so this must run inside a Tokio runtime.
    pub fn new(
        transfer: Arc<TransferOrchestrator>,
        adapters: AdapterSet,
        target: Arc<dyn TargetProvider>,
        settings: ApplicationSettings,
    ) -> Self {
        Self {
            transfer,
            adapters: Arc::new(adapters),
            target,
            executor: TargetExecutor::spawn(),
            events: EventBus::default(),
            settings: Arc::new(settings),
            runtime: Handle::current(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}
