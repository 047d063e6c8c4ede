use super::{ApplicationCoordinator, Session};
use crate::adapter::{AdapterHandle, Affinity, ApplyRequest, Payload, RevertRequest};
use crate::error::{Error, ErrorKind, Result};
use crate::event::SyncEvent;
use crate::session::SessionId;
use crate::settings::ApplyOrdering;
use crate::target::TargetHandle;
use mirage_model::{Capability, CategoryData, ChangeSet, ObjectKind};
use mirage_transfer::ResolvedFiles;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOwner {
    Session,
    Revert,
}

/// The per-peer right to touch the target. Held by at most one session or
/// revert at a time.
#[derive(Debug, Default)]
pub(super) struct ApplySlot {
    owner: Mutex<Option<SlotOwner>>,
}

pub(super) struct SlotGuard<'a> {
    slot: &'a ApplySlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slot.owner.lock() = None;
    }
}

impl ApplySlot {
    fn try_claim(&self, owner: SlotOwner) -> Option<SlotGuard<'_>> {
        let mut current = self.owner.lock();
        if current.is_some() {
            return None;
        }
        *current = Some(owner);
        Some(SlotGuard { slot: self })
    }

    /// Waits for the slot, giving way to any revert in progress.
    pub(super) async fn acquire_for_session(
        &self,
        coordinator: &ApplicationCoordinator,
        token: &CancellationToken,
    ) -> Result<SlotGuard<'_>> {
        let poll = coordinator.context.settings.poll_interval;
        loop {
            if token.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let reverting = coordinator.state.lock().reverting > 0;
            if !reverting && let Some(guard) = self.try_claim(SlotOwner::Session) {
                return Ok(guard);
            }
            wait(poll, token).await?;
        }
    }

    async fn acquire_for_revert(&self, poll: Duration, token: &CancellationToken) -> Result<SlotGuard<'_>> {
        loop {
            if let Some(guard) = self.try_claim(SlotOwner::Revert) {
                return Ok(guard);
            }
            wait(poll, token).await?;
        }
    }
}

async fn wait(duration: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

struct Call {
    capability: Capability,
    adapter: AdapterHandle,
    request: ApplyRequest,
}

/// Adapter calls for one object kind.
struct Plan {
    kind: ObjectKind,
    calls: Vec<Call>,
}

impl ApplicationCoordinator {
    /// Applies every changed capability, returning how many adapter calls
    /// succeeded.
    ///
    /// Only cancellation and an invalidated target abort the pass; a failing
    /// adapter is logged and its siblings carry on.
    pub(super) async fn apply(
        &self,
        session: &Session,
        changes: &ChangeSet,
        resolved: Option<&ResolvedFiles>,
    ) -> Result<usize> {
        let mut plans = Vec::new();
        let mut unavailable = BTreeSet::new();
        for (kind, capabilities) in changes.iter() {
            let Some(target) = self.context.target.resolve(&self.peer, kind) else {
                if kind == ObjectKind::Player {
                    exn::bail!(ErrorKind::TargetInvalidated);
                }
                tracing::debug!(peer = %self.peer, %kind, "object not drawn, skipping");
                continue;
            };
            let category = session.snapshot.category(kind);
            let mut calls = Vec::new();
            for &capability in capabilities {
                let Some(adapter) = self.context.adapters.get(capability).filter(|a| a.is_available()) else {
                    unavailable.insert(capability);
                    continue;
                };
                calls.push(Call {
                    capability,
                    adapter: adapter.clone(),
                    request: ApplyRequest {
                        peer: self.peer.clone(),
                        session: session.id,
                        kind,
                        target,
                        payload: payload(capability, kind, category, resolved),
                    },
                });
            }
            plans.push(Plan { kind, calls });
        }
        self.notify_unavailable(unavailable);

        let mut applied = 0;
        for plan in plans {
            applied += self.run_plan(plan, &session.apply).await?;
        }
        Ok(applied)
    }

    async fn run_plan(&self, plan: Plan, token: &CancellationToken) -> Result<usize> {
        let Plan { kind, calls } = plan;
        let (redraws, calls): (Vec<_>, Vec<_>) =
            calls.into_iter().partition(|call| call.capability == Capability::ForcedRedraw);
        let mut applied = 0;
        match self.context.settings.ordering {
            ApplyOrdering::Serialized => {
                for call in calls {
                    applied += self.settle(kind, call, token).await?;
                }
            },
            ApplyOrdering::Concurrent => {
                let (affine, free): (Vec<_>, Vec<_>) =
                    calls.into_iter().partition(|call| call.adapter.affinity() == Affinity::Target);
                let serial = async {
                    let mut applied = 0;
                    for call in affine {
                        applied += self.settle(kind, call, token).await?;
                    }
                    Ok::<usize, Error>(applied)
                };
                let parallel = futures::future::join_all(free.into_iter().map(|call| self.settle(kind, call, token)));
                let (serial, parallel) = tokio::join!(serial, parallel);
                applied += serial?;
                for result in parallel {
                    applied += result?;
                }
            },
        }
        // Redraws go last so they pick up everything applied above.
        for call in redraws {
            applied += self.settle(kind, call, token).await?;
        }
        Ok(applied)
    }

    /// Runs one call and records it. Returns the number of successful calls.
    async fn settle(&self, kind: ObjectKind, call: Call, token: &CancellationToken) -> Result<usize> {
        let capability = call.capability;
        let clear = call.request.payload == Payload::Clear;
        match self.apply_one(call, token).await {
            Ok(()) => {
                let mut state = self.state.lock();
                if clear {
                    if let Some(capabilities) = state.applied.get_mut(&kind) {
                        capabilities.remove(&capability);
                        if capabilities.is_empty() {
                            state.applied.remove(&kind);
                        }
                    }
                } else {
                    state.applied.entry(kind).or_default().insert(capability);
                }
                Ok(1)
            },
            Err(error) if error.is_cancelled() || matches!(&*error, ErrorKind::TargetInvalidated) => Err(error),
            Err(error) => {
                let error = error.raise(ErrorKind::AdapterFailure(capability));
                tracing::warn!(peer = %self.peer, %kind, %capability, ?error, "capability not applied");
                Ok(0)
            },
        }
    }

    async fn apply_one(&self, call: Call, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        if !self.context.target.is_valid(call.request.target) {
            exn::bail!(ErrorKind::TargetInvalidated);
        }
        let Call { adapter, request, .. } = call;
        self.dispatch(&adapter, token, move |adapter, token| async move { adapter.apply(&request, &token).await })
            .await
    }

    /// Undoes every applied capability, then releases each adapter's
    /// per-peer scope.
    pub(super) async fn revert_applied(&self, token: &CancellationToken) -> Result<()> {
        let _slot = self.slot.acquire_for_revert(self.context.settings.poll_interval, token).await?;
        let applied = std::mem::take(&mut self.state.lock().applied);
        let session = SessionId::next();
        for (kind, capabilities) in applied {
            let target: Option<TargetHandle> = self.context.target.resolve(&self.peer, kind);
            for capability in capabilities {
                let Some(adapter) = self.context.adapters.get(capability).filter(|a| a.is_available()) else {
                    continue;
                };
                let request = RevertRequest { peer: self.peer.clone(), session, kind, target };
                let result = self
                    .dispatch(adapter, token, move |adapter, token| async move { adapter.revert(&request, &token).await })
                    .await;
                match result {
                    Ok(()) => {},
                    Err(error) if error.is_cancelled() => return Err(error),
                    Err(error) => {
                        let error = error.raise(ErrorKind::AdapterFailure(capability));
                        tracing::warn!(peer = %self.peer, %kind, %capability, ?error, "capability not reverted");
                    },
                }
            }
        }
        for adapter in self.context.adapters.iter() {
            let peer = self.peer.clone();
            let result = self
                .dispatch(adapter, token, move |adapter, token| async move { adapter.release_scope(&peer, &token).await })
                .await;
            match result {
                Ok(()) => {},
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    let capability = adapter.capability();
                    let error = error.raise(ErrorKind::AdapterFailure(capability));
                    tracing::warn!(peer = %self.peer, %capability, ?error, "adapter scope not released");
                },
            }
        }
        Ok(())
    }

    /// Runs an adapter call where its affinity allows, abandoning it as soon
    /// as `token` fires.
    async fn dispatch<F, Fut>(&self, adapter: &AdapterHandle, token: &CancellationToken, call: F) -> Result<()>
    where
        F: FnOnce(AdapterHandle, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let affinity = adapter.affinity();
        let work = call(adapter.clone(), token.clone());
        let run = async move {
            match affinity {
                Affinity::Target => self.context.executor.run(work).await.and_then(|result| result),
                Affinity::Any => work.await,
            }
        };
        tokio::select! {
            () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            result = run => result,
        }
    }

    /// Tells observers about capabilities without an adapter, once each.
    fn notify_unavailable(&self, unavailable: BTreeSet<Capability>) {
        let fresh: BTreeSet<_> = {
            let mut state = self.state.lock();
            let fresh: BTreeSet<_> = unavailable.difference(&state.notified_unavailable).copied().collect();
            state.notified_unavailable.extend(fresh.iter().copied());
            fresh
        };
        if fresh.is_empty() {
            return;
        }
        tracing::info!(peer = %self.peer, capabilities = ?fresh, "no adapter available for capabilities");
        self.context.events.publish(SyncEvent::CapabilitiesUnavailable { peer: self.peer.clone(), capabilities: fresh });
    }
}

fn payload(
    capability: Capability,
    kind: ObjectKind,
    category: Option<&CategoryData>,
    resolved: Option<&ResolvedFiles>,
) -> Payload {
    match capability {
        Capability::ForcedRedraw => Payload::Redraw,
        Capability::ModFiles => match resolved.and_then(|resolved| resolved.redirects(kind)) {
            Some(redirects) if !redirects.is_empty() => Payload::Files(redirects.clone()),
            _ => Payload::Clear,
        },
        blob => match category.and_then(|category| category.blob(blob)) {
            Some(data) => Payload::Blob(data.to_string()),
            None => Payload::Clear,
        },
    }
}
