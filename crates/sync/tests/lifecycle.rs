mod common;

use common::{Harness, fast, player_file, snapshot_with_file, snapshot_with_title};
use mirage_model::{Capability, ObjectKind, PeerId, SnapshotBuilder};
use mirage_sync::error::ErrorKind;
use mirage_sync::mock::Recorded;
use mirage_sync::{
    ApplicationSettings, PairingSource, Payload, PermissionSet, Phase, RestrictedState, RevertReason, SessionOutcome,
    SyncEvent, TargetProvider, Thresholds,
};
use std::collections::BTreeSet;
use std::time::Duration;

#[tokio::test]
async fn test_threshold_breach_holds_application() {
    let settings =
        ApplicationSettings { thresholds: Thresholds { max_total_bytes: Some(8), max_file_count: None }, ..fast() };
    let mut harness = Harness::new(settings).await;
    let hash = harness.remote.add(b"far more than eight bytes".to_vec());

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    assert!(matches!(session.await.unwrap(), SessionOutcome::ThresholdExceeded(_)));
    assert_eq!(harness.log.apply_count(), 0);
    // Downloaded all the same.
    assert!(harness.store.entry(&hash).is_some());
    assert_eq!(
        harness.registry.hold_reasons(&harness.peer),
        vec!["application hold: resource threshold exceeded".to_string()]
    );

    // A second breach doesn't stack the hold.
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    let again = coordinator.receive(snapshot_with_file(&hash), true);
    assert!(matches!(again.await.unwrap(), SessionOutcome::ThresholdExceeded(_)));
    assert_eq!(harness.registry.hold_reasons(&harness.peer).len(), 1);

    // Releasing accepts the held baseline, which replays on its own.
    harness.drain_events();
    assert!(coordinator.release_threshold_hold());
    assert!(harness.registry.hold_reasons(&harness.peer).is_empty());
    let outcome = next_outcome(&mut harness).await;
    assert_eq!(outcome, SessionOutcome::Applied(1));
    assert_eq!(harness.log.apply_count(), 1);
    assert_eq!(coordinator.phase(), Phase::Applied);
    assert!(!coordinator.release_threshold_hold());
}

/// Waits for the next session of the harness peer to finish.
async fn next_outcome(harness: &mut Harness) -> SessionOutcome {
    let finished = async {
        loop {
            if let Ok(SyncEvent::SessionFinished { outcome, .. }) = harness.events.recv().await {
                return outcome;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), finished).await.unwrap()
}

#[tokio::test]
async fn test_application_hold_still_downloads() {
    let harness = Harness::new(fast()).await;
    let hash = harness.remote.add(b"moderated".to_vec());
    let _hold = harness.registry.hold(&harness.peer, mirage_sync::HoldKind::Application, "moderation", 1).unwrap();

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::ApplicationHeld);
    assert!(harness.store.entry(&hash).is_some());
    assert_eq!(harness.log.apply_count(), 0);
}

#[tokio::test]
async fn test_pending_target_retries_once_ready() {
    let harness = Harness::new(fast()).await;
    harness.target.hide(&harness.peer, ObjectKind::Player);

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::PendingTarget);
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.phase(), Phase::PendingTargetReady);

    // Still not drawn: the retry is parked again, without spamming.
    let retries = harness.registry.target_ready();
    assert_eq!(retries.len(), 1);
    for retry in retries {
        assert_eq!(retry.await.unwrap(), SessionOutcome::PendingTarget);
    }

    harness.target.show(&harness.peer, ObjectKind::Player);
    let retries = harness.registry.target_ready();
    assert_eq!(retries.len(), 1);
    assert!(harness.registry.target_ready().is_empty(), "a retry is already running");
    for retry in retries {
        assert_eq!(retry.await.unwrap(), SessionOutcome::Applied(1));
    }
    assert!(harness.registry.target_ready().is_empty());
}

#[tokio::test]
async fn test_zone_transition_timeout_defers() {
    let settings = ApplicationSettings { transition_timeout: Duration::from_millis(30), ..fast() };
    let harness = Harness::new(settings).await;
    harness.target.set_transitioning(true);

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::PendingTarget);

    harness.target.set_transitioning(false);
    let retries = harness.registry.target_ready();
    assert_eq!(retries.len(), 1);
    for retry in retries {
        assert_eq!(retry.await.unwrap(), SessionOutcome::Applied(1));
    }
}

#[tokio::test]
async fn test_zone_transition_cancels_sessions() {
    let harness = Harness::new(fast()).await;
    harness.target.set_transitioning(true);
    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    harness.registry.zone_transition_started();
    assert_eq!(session.await.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(harness.log.apply_count(), 0);
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.phase(), Phase::PendingTargetReady);

    // The interrupted snapshot resumes once the target is back.
    harness.target.set_transitioning(false);
    let retries = harness.registry.target_ready();
    assert_eq!(retries.len(), 1);
    for retry in retries {
        assert_eq!(retry.await.unwrap(), SessionOutcome::Applied(1));
    }
    assert_eq!(harness.log.apply_count(), 1);
    assert!(harness.registry.target_ready().is_empty());
}

#[tokio::test]
async fn test_zone_transition_without_session_has_nothing_to_resume() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(first.await.unwrap(), SessionOutcome::Applied(1));

    harness.registry.zone_transition_started();
    assert!(harness.registry.target_ready().is_empty());
    assert_eq!(harness.log.apply_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_from_host_thread() {
    let harness = Harness::new(fast()).await;
    let session = std::thread::scope(|scope| {
        scope.spawn(|| harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero"))).join().unwrap()
    });
    assert_eq!(session.unwrap().await.unwrap(), SessionOutcome::Applied(1));
    assert_eq!(harness.log.apply_count(), 1);
}

#[tokio::test]
async fn test_unresponsive_revert_times_out() {
    let settings = ApplicationSettings { revert_timeout: Duration::from_millis(50), ..fast() };
    let mut harness = Harness::new(settings).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(first.await.unwrap(), SessionOutcome::Applied(1));
    harness.adapter(Capability::Title).set_delay(Duration::from_secs(30));
    harness.drain_events();

    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    let started = std::time::Instant::now();
    let error = coordinator.revert(RevertReason::Requested).await.unwrap_err();
    assert!(matches!(&*error, ErrorKind::RevertTimedOut));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(coordinator.phase(), Phase::Idle);
    assert!(coordinator.baseline().is_none());
    assert!(harness.drain_events().iter().any(|event| matches!(
        event,
        SyncEvent::Reverted { reason: RevertReason::Requested, .. }
    )));
}

#[tokio::test]
async fn test_restricted_state_buffers_latest() {
    let harness = Harness::new(fast()).await;
    harness.registry.restricted_state_started(RestrictedState::Combat);

    for title in ["First", "Second", "Third"] {
        let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title(title)).unwrap();
        assert_eq!(session.await.unwrap(), SessionOutcome::Deferred);
    }
    assert_eq!(harness.log.apply_count(), 0);

    // Another restriction keeps it buffered.
    harness.registry.restricted_state_started(RestrictedState::Performance);
    assert!(harness.registry.restricted_state_ended(RestrictedState::Combat).is_empty());

    let resumed = harness.registry.restricted_state_ended(RestrictedState::Performance);
    assert_eq!(resumed.len(), 1);
    for session in resumed {
        assert_eq!(session.await.unwrap(), SessionOutcome::Applied(1));
    }
    let applies = harness.log.applies();
    assert_eq!(applies.len(), 1);
    assert!(matches!(&applies[0], Recorded::Apply { payload: Payload::Blob(title), .. } if title == "Third"));
}

#[tokio::test]
async fn test_restricted_state_ignored_when_not_deferring() {
    let settings = ApplicationSettings { defer_in_combat: false, ..fast() };
    let harness = Harness::new(settings).await;
    harness.registry.restricted_state_started(RestrictedState::Combat);

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::Applied(1));
}

#[tokio::test]
async fn test_failing_adapter_does_not_stop_siblings() {
    let harness = Harness::new(fast()).await;
    harness.adapter(Capability::Title).set_failing(true);
    let snapshot = SnapshotBuilder::new()
        .blob(ObjectKind::Player, Capability::Title, "Hero")
        .blob(ObjectKind::Player, Capability::HeightOffset, "1.05")
        .blob(ObjectKind::Player, Capability::StatusIcons, "[]")
        .finalize()
        .unwrap();

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::Applied(2));
    assert_eq!(harness.log.apply_count(), 3);
    let applied = harness.registry.peer(&harness.peer).unwrap().coordinator().applied();
    assert!(!applied[&ObjectKind::Player].contains(&Capability::Title));
}

#[tokio::test]
async fn test_unavailable_adapter_notifies_once() {
    let mut harness = Harness::new(fast()).await;
    harness.adapter(Capability::PetNickname).set_available(false);
    harness.target.show(&harness.peer, ObjectKind::Pet);

    for name in ["Carbuncle", "Eos", "Selene"] {
        let snapshot = SnapshotBuilder::new().blob(ObjectKind::Pet, Capability::PetNickname, name).finalize().unwrap();
        let session = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
        assert_eq!(session.await.unwrap(), SessionOutcome::Applied(0));
    }

    let notices: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::CapabilitiesUnavailable { capabilities, .. } => Some(capabilities),
            _ => None,
        })
        .collect();
    assert_eq!(notices, vec![BTreeSet::from([Capability::PetNickname])]);
    assert_eq!(harness.log.apply_count(), 0);
}

#[tokio::test]
async fn test_undrawn_companion_is_skipped() {
    let harness = Harness::new(fast()).await;
    let snapshot = SnapshotBuilder::new()
        .blob(ObjectKind::Player, Capability::Title, "Hero")
        .blob(ObjectKind::Pet, Capability::PetNickname, "Eos")
        .finalize()
        .unwrap();

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::Applied(1));
}

#[tokio::test]
async fn test_invalidated_target_forces_full_reapply() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(first.await.unwrap(), SessionOutcome::Applied(1));

    // The object was redrawn behind our back.
    let stale = harness.target.resolve(&harness.peer, ObjectKind::Player).unwrap();
    let snapshot = SnapshotBuilder::new()
        .blob(ObjectKind::Player, Capability::Title, "Hero")
        .blob(ObjectKind::Player, Capability::HeightOffset, "0.9")
        .finalize()
        .unwrap();
    harness.target.invalidate(stale);
    let second = harness.registry.receive_snapshot(&harness.peer, snapshot.clone()).unwrap();
    assert_eq!(second.await.unwrap(), SessionOutcome::TargetInvalidated);
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert!(coordinator.is_dirty());

    harness.target.show(&harness.peer, ObjectKind::Player);
    harness.log.clear();
    let third = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
    // Title is unchanged but redone anyway.
    assert_eq!(third.await.unwrap(), SessionOutcome::Applied(2));
    assert!(!coordinator.is_dirty());
}

#[tokio::test]
async fn test_denied_categories_are_stripped() {
    let harness = Harness::new(fast()).await;
    let model = harness.remote.add(b"model".to_vec());
    let sound = harness.remote.add(b"sound".to_vec());
    _ = harness
        .registry
        .register_pairing(harness.peer.clone(), PairingSource::Direct, PermissionSet {
            disable_sounds: true,
            ..PermissionSet::default()
        })
        .await;

    let snapshot = SnapshotBuilder::new()
        .file(ObjectKind::Player, player_file("chara/body.mdl", &model))
        .file(ObjectKind::Player, player_file("sound/battle/hit.scd", &sound))
        .finalize()
        .unwrap();
    let session = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::Applied(2));
    assert_eq!(harness.remote.fetch_count(&sound), 0);
    assert_eq!(harness.remote.fetch_count(&model), 1);
    let files = harness
        .log
        .applies()
        .into_iter()
        .find_map(|call| match call {
            Recorded::Apply { payload: Payload::Files(files), .. } => Some(files),
            _ => None,
        })
        .unwrap();
    assert_eq!(files.len(), 1);

    // Allowing sounds again re-applies with them included.
    harness.log.clear();
    let reapplied = harness
        .registry
        .register_pairing(harness.peer.clone(), PairingSource::Direct, PermissionSet::default())
        .await
        .unwrap();
    assert_eq!(reapplied.await.unwrap(), SessionOutcome::Applied(2));
    assert_eq!(harness.remote.fetch_count(&sound), 1);
}

#[tokio::test]
async fn test_group_pairing_keeps_peer_unpaused() {
    let harness = Harness::new(fast()).await;
    let group = PairingSource::Group("raid".into());
    _ = harness.registry.register_pairing(harness.peer.clone(), group, PermissionSet::default()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();

    // Pausing the direct pairing alone changes nothing.
    let paused = PermissionSet { paused: true, ..PermissionSet::default() };
    assert!(harness.registry.register_pairing(harness.peer.clone(), PairingSource::Direct, paused).await.is_none());
    assert!(harness.log.reverts().is_empty());
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.phase(), Phase::Applied);
}

#[tokio::test]
async fn test_pausing_reverts_and_ignores_snapshots() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();

    let paused = PermissionSet { paused: true, ..PermissionSet::default() };
    assert!(harness.registry.register_pairing(harness.peer.clone(), PairingSource::Direct, paused).await.is_none());
    assert_eq!(harness.log.reverts().len(), 1);
    assert!(harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Villain")).is_none());

    let resumed = harness
        .registry
        .register_pairing(harness.peer.clone(), PairingSource::Direct, PermissionSet::default())
        .await
        .unwrap();
    assert_eq!(resumed.await.unwrap(), SessionOutcome::Applied(1));
    assert!(matches!(
        harness.log.applies().last(),
        Some(Recorded::Apply { payload: Payload::Blob(title), .. }) if title == "Villain"
    ));
}

#[tokio::test]
async fn test_offline_peer_reverts_and_resumes() {
    let mut harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();

    assert!(harness.registry.set_online(&harness.peer, false).await.is_none());
    assert_eq!(harness.log.reverts().len(), 1);
    assert!(harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Villain")).is_none());
    let events = harness.drain_events();
    assert!(events.contains(&SyncEvent::PeerOffline(harness.peer.clone())));

    let resumed = harness.registry.set_online(&harness.peer, true).await.unwrap();
    assert_eq!(resumed.await.unwrap(), SessionOutcome::Applied(1));
}

#[tokio::test]
async fn test_unregistering_last_pairing_disposes() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();

    assert!(!harness.registry.unregister_pairing(&harness.peer, &PairingSource::Group("raid".into())).await);
    assert!(harness.registry.unregister_pairing(&harness.peer, &PairingSource::Direct).await);
    assert!(harness.registry.peer(&harness.peer).is_none());
    assert_eq!(coordinator.phase(), Phase::Disposed);
    assert_eq!(harness.log.reverts().len(), 1);
    assert_eq!(coordinator.receive(snapshot_with_title("Late"), false).await.unwrap(), SessionOutcome::Ignored);
    assert!(harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Later")).is_none());
}

#[tokio::test]
async fn test_unknown_peer_is_ignored() {
    let harness = Harness::new(fast()).await;
    assert!(harness.registry.receive_snapshot(&PeerId::new("stranger"), snapshot_with_title("Hi")).is_none());
    assert!(harness.registry.hold_reasons(&PeerId::new("stranger")).is_empty());
}

#[tokio::test]
async fn test_shutdown_disposes_everyone() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();

    harness.registry.shutdown().await;
    assert!(harness.registry.peer_ids().is_empty());
    assert_eq!(harness.log.reverts().len(), 1);
}
