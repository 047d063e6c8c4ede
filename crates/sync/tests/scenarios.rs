mod common;

use common::{Harness, fast, snapshot_with_file, snapshot_with_title};
use mirage_model::{Capability, ObjectKind};
use mirage_sync::mock::Recorded;
use mirage_sync::{HoldKind, Payload, Phase, SessionOutcome, SyncEvent};
use std::time::Duration;

async fn next_outcome(harness: &mut Harness) -> SessionOutcome {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SyncEvent::SessionFinished { outcome, .. } = harness.events.recv().await.unwrap() {
                return outcome;
            }
        }
    })
    .await
    .expect("no session finished")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_missing_content_is_fetched_then_applied() {
    let harness = Harness::new(fast()).await;
    let hash = harness.remote.add(b"ab12 texture".to_vec());
    assert!(harness.store.entry(&hash).is_none());

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    let outcome = session.await.unwrap();

    // Mod files plus the redraw they require.
    assert_eq!(outcome, SessionOutcome::Applied(2));
    assert!(harness.store.entry(&hash).is_some());
    assert_eq!(harness.remote.fetch_count(&hash), 1);
    let applies = harness.log.applies();
    let files: Vec<_> = applies
        .iter()
        .filter(|call| matches!(call, Recorded::Apply { capability: Capability::ModFiles, .. }))
        .collect();
    assert_eq!(files.len(), 1);
    let Recorded::Apply { kind, payload: Payload::Files(redirects), .. } = files[0] else {
        panic!("unexpected call {:?}", files[0]);
    };
    assert_eq!(*kind, ObjectKind::Player);
    assert_eq!(redirects.len(), 1);
    // The redraw lands last.
    assert!(matches!(applies.last(), Some(Recorded::Apply { capability: Capability::ForcedRedraw, .. })));
    let peer = harness.registry.peer(&harness.peer).unwrap();
    assert_eq!(peer.coordinator().phase(), Phase::Applied);
}

#[tokio::test]
async fn test_unchanged_snapshot_makes_no_calls() {
    let harness = Harness::new(fast()).await;
    let hash = harness.remote.add(b"ab12 texture".to_vec());
    let snapshot = snapshot_with_file(&hash);
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot.clone()).unwrap();
    assert!(matches!(first.await.unwrap(), SessionOutcome::Applied(_)));
    harness.log.clear();

    let second = harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap();
    assert_eq!(second.await.unwrap(), SessionOutcome::NoChanges);
    assert!(harness.log.calls().is_empty());
    assert_eq!(harness.remote.fetch_count(&hash), 1);
}

#[tokio::test]
async fn test_download_hold_defers_until_released() {
    let mut harness = Harness::new(fast()).await;
    let hash = harness.remote.add(b"held texture".to_vec());
    let guard = harness.registry.hold(&harness.peer, HoldKind::Download, "blocklist", 1).unwrap();
    assert_eq!(harness.registry.hold_reasons(&harness.peer), vec!["download hold: blocklist".to_string()]);

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::DownloadHeld);
    assert_eq!(harness.log.apply_count(), 0);
    assert_eq!(harness.remote.total_fetches(), 0);
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.phase(), Phase::Held);
    assert!(coordinator.is_dirty());
    harness.drain_events();

    assert!(guard.release());
    assert_eq!(next_outcome(&mut harness).await, SessionOutcome::Applied(2));
    assert_eq!(harness.remote.fetch_count(&hash), 1);
    assert_eq!(harness.log.apply_count(), 2);
    assert!(!coordinator.is_dirty());
    assert!(harness.registry.hold_reasons(&harness.peer).is_empty());
}

#[tokio::test]
async fn test_visibility_loss_reverts_before_next_apply() {
    let harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    assert_eq!(first.await.unwrap(), SessionOutcome::Applied(1));

    harness.adapter(Capability::Title).set_delay(Duration::from_secs(3));
    let second = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Villain")).unwrap();
    let log = harness.log.clone();
    wait_until(move || log.apply_count() == 2).await;
    // Only affects calls made from now on, so the revert isn't slowed down.
    harness.adapter(Capability::Title).set_delay(Duration::ZERO);

    assert!(harness.registry.set_visible(&harness.peer, false).await.is_none());
    assert_eq!(second.await.unwrap(), SessionOutcome::Cancelled);
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.phase(), Phase::Idle);
    assert!(coordinator.applied().is_empty());

    let third = harness.registry.set_visible(&harness.peer, true).await.unwrap();
    assert_eq!(third.await.unwrap(), SessionOutcome::Applied(1));

    let calls = harness.log.calls();
    let revert = calls.iter().position(Recorded::is_revert).expect("title was reverted");
    let last_apply = calls.iter().rposition(Recorded::is_apply).unwrap();
    assert!(revert < last_apply);
    // Nothing was applied between the interrupted apply and the revert.
    assert_eq!(calls[..revert].iter().filter(|call| call.is_apply()).count(), 2);
    assert_eq!(harness.log.overlaps(), 0);
}

#[tokio::test]
async fn test_revert_releases_adapter_scopes() {
    let mut harness = Harness::new(fast()).await;
    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    session.await.unwrap();
    harness.drain_events();

    harness.registry.set_visible(&harness.peer, false).await;
    let calls = harness.log.calls();
    let scopes = calls.iter().filter(|call| matches!(call, Recorded::ReleaseScope { .. })).count();
    assert_eq!(scopes, Capability::ALL.len());
    assert!(
        harness.drain_events().iter().any(|event| matches!(event, SyncEvent::Reverted { .. })),
        "revert was announced"
    );
}
