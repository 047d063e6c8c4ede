use super::{ApplicationCoordinator, Deferral, Session, THRESHOLD_HOLD_REASON};
use crate::error::ErrorKind;
use crate::hold::HoldKind;
use crate::session::{Phase, SessionId, SessionOutcome};
use mirage_model::{Capability, ChangeSet, ObjectKind, compare};
use mirage_transfer::{Redirect, ResolvedFiles};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

impl ApplicationCoordinator {
    pub(super) async fn pipeline(&self, session: &Session) -> SessionOutcome {
        let id = session.id;
        let (baseline, dirty) = {
            let state = self.state.lock();
            (state.baseline.clone(), state.dirty)
        };
        let changes = compare(&session.snapshot, baseline.as_ref(), session.force || dirty);
        if changes.is_empty() {
            return SessionOutcome::NoChanges;
        }
        tracing::debug!(peer = %self.peer, session = %id, changes = changes.len(), "snapshot diffed");
        self.set_phase(id, Phase::Diffed);

        if self.holds.is_download_held() {
            self.hold_as_baseline(session);
            return SessionOutcome::DownloadHeld;
        }

        if let Err(outcome) = self.await_target(session).await {
            return outcome;
        }

        let resolved = if touches_files(&changes) {
            self.set_phase(id, Phase::Downloading);
            match self.download(session).await {
                Ok(resolved) => Some(resolved),
                Err(outcome) => return outcome,
            }
        } else {
            None
        };
        if session.apply.is_cancelled() {
            return self.cancelled_outcome(session);
        }

        if let Some(resolved) = &resolved {
            let (bytes, files) = footprint(resolved);
            if let Some(breach) = self.context.settings.thresholds.check(bytes, files)
                && !self.is_threshold_accepted(session)
            {
                self.hold_for_threshold(session);
                return SessionOutcome::ThresholdExceeded(breach);
            }
        }
        if self.holds.is_application_held() {
            self.hold_as_baseline(session);
            return SessionOutcome::ApplicationHeld;
        }
        {
            let mut state = self.state.lock();
            if self.is_deferring(&state) {
                state.buffered = Some((session.snapshot.clone(), session.force));
                return SessionOutcome::Deferred;
            }
        }

        self.set_phase(id, Phase::ReadyToApply);
        let Ok(_slot) = self.slot.acquire_for_session(self, &session.apply).await else {
            return self.cancelled_outcome(session);
        };
        if session.apply.is_cancelled() {
            return self.cancelled_outcome(session);
        }
        self.set_phase(id, Phase::Applying);

        match self.apply(session, &changes, resolved.as_ref()).await {
            Ok(applied) => {
                let mut state = self.state.lock();
                state.baseline = Some(session.snapshot.clone());
                state.dirty = false;
                if state.is_current(id) {
                    state.phase = Phase::Applied;
                }
                SessionOutcome::Applied(applied)
            },
            Err(error) => {
                // Part of the snapshot may already be on the target.
                self.state.lock().dirty = true;
                match &*error {
                    ErrorKind::TargetInvalidated => {
                        self.set_phase(id, Phase::Idle);
                        SessionOutcome::TargetInvalidated
                    },
                    _ => self.cancelled_outcome(session),
                }
            },
        }
    }

    /// What to report for a session that stopped because a token fired.
    fn cancelled_outcome(&self, session: &Session) -> SessionOutcome {
        if self.is_deferring(&self.state.lock()) {
            SessionOutcome::Deferred
        } else if session.download.is_cancelled() {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Superseded
        }
    }

    /// Remembers the snapshot as what should be shown once holds clear.
    fn hold_as_baseline(&self, session: &Session) {
        let mut state = self.state.lock();
        state.baseline = Some(session.snapshot.clone());
        state.dirty = true;
        if state.is_current(session.id) {
            state.phase = Phase::Held;
        }
    }

    fn is_threshold_accepted(&self, session: &Session) -> bool {
        self.state.lock().threshold_accepted.as_ref() == Some(session.snapshot.content_hash())
    }

    fn hold_for_threshold(&self, session: &Session) {
        let mut guard = Some(self.holds.acquire(HoldKind::Application, THRESHOLD_HOLD_REASON, 1));
        {
            let mut state = self.state.lock();
            if state.threshold_hold.is_none() {
                state.threshold_hold = guard.take();
            }
        }
        // A second guard at the clamp owns no count; dropping it is a no-op.
        drop(guard);
        self.hold_as_baseline(session);
    }

    fn defer(&self, id: SessionId) -> SessionOutcome {
        let mut state = self.state.lock();
        state.deferred = Some(Deferral { session: id, retrying: false });
        if state.is_current(id) {
            state.phase = Phase::PendingTargetReady;
        }
        SessionOutcome::PendingTarget
    }

    /// Waits out a zone transition, then checks the peer's player object is
    /// drawn.
    async fn await_target(&self, session: &Session) -> Result<(), SessionOutcome> {
        let settings = &self.context.settings;
        let target = &self.context.target;
        let deadline = Instant::now() + settings.transition_timeout;
        while target.is_transitioning() {
            if Instant::now() >= deadline {
                tracing::debug!(peer = %self.peer, session = %session.id, "zone transition did not finish in time");
                return Err(self.defer(session.id));
            }
            if !sleep(settings.poll_interval, &session.apply).await {
                return Err(self.cancelled_outcome(session));
            }
        }
        if target.resolve(&self.peer, ObjectKind::Player).is_none() {
            return Err(self.defer(session.id));
        }
        Ok(())
    }

    /// Resolves the snapshot's files against the store, fetching what's
    /// missing until everything resolves or the attempts run out.
    async fn download(&self, session: &Session) -> Result<ResolvedFiles, SessionOutcome> {
        let transfer = &self.context.transfer;
        let settings = &self.context.settings;
        let max_attempts = settings.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            let resolved = match transfer.resolve_missing(&session.snapshot).await {
                Ok(resolved) => resolved,
                Err(error) if attempts >= max_attempts => {
                    tracing::warn!(peer = %self.peer, session = %session.id, ?error, "could not resolve content");
                    return Err(SessionOutcome::ContentUnavailable(session.snapshot.files().count()));
                },
                Err(error) => {
                    tracing::warn!(peer = %self.peer, session = %session.id, ?error, "could not resolve content, retrying");
                    attempts += 1;
                    if !sleep(settings.retry_backoff, &session.download).await {
                        return Err(self.cancelled_outcome(session));
                    }
                    continue;
                },
            };
            if resolved.is_complete() {
                return Ok(resolved);
            }
            let missing = resolved.missing_hashes();
            if missing.iter().all(|hash| transfer.is_forbidden(hash)) {
                let error = exn::Exn::from(ErrorKind::PermanentlyForbiddenContent(missing.len()));
                tracing::info!(peer = %self.peer, session = %session.id, ?error, "giving up on content");
                return Err(SessionOutcome::ContentUnavailable(resolved.missing().len()));
            }
            if attempts >= max_attempts {
                tracing::info!(
                    peer = %self.peer,
                    session = %session.id,
                    attempts,
                    missing = missing.len(),
                    "content still missing after all attempts"
                );
                return Err(SessionOutcome::ContentUnavailable(resolved.missing().len()));
            }
            if attempts > 0 && !sleep(settings.retry_backoff, &session.download).await {
                return Err(self.cancelled_outcome(session));
            }
            attempts += 1;
            let replacements = resolved.missing_replacements();
            match transfer.fetch(&self.peer, &replacements, &session.download).await {
                Ok(report) => tracing::debug!(
                    peer = %self.peer,
                    session = %session.id,
                    attempt = attempts,
                    fetched = report.fetched.len(),
                    failed = report.failed.len(),
                    "fetch attempt finished"
                ),
                Err(error) if error.is_cancelled() => return Err(self.cancelled_outcome(session)),
                Err(error) => {
                    let error = error.raise(ErrorKind::TransientFetchFailure);
                    tracing::warn!(peer = %self.peer, session = %session.id, attempt = attempts, ?error, "fetch failed");
                },
            }
        }
    }
}

fn touches_files(changes: &ChangeSet) -> bool {
    changes.iter().any(|(_, capabilities)| capabilities.contains(&Capability::ModFiles))
}

/// Total bytes and count of distinct cached files a snapshot redirects to.
fn footprint(resolved: &ResolvedFiles) -> (u64, usize) {
    let mut seen = HashSet::new();
    let mut bytes = 0;
    for kind in ObjectKind::ALL {
        let Some(redirects) = resolved.redirects(kind) else { continue };
        for redirect in redirects.values() {
            if let Redirect::Cached(content) = redirect
                && seen.insert(content.entry.hash.clone())
            {
                bytes += content.entry.size;
            }
        }
    }
    (bytes, seen.len())
}

/// Returns `false` if `token` fired first.
async fn sleep(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
