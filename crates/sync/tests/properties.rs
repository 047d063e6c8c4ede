mod common;

use common::{Harness, fast, snapshot_with_file, snapshot_with_title};
use mirage_model::{Capability, ObjectKind};
use mirage_sync::mock::Recorded;
use mirage_sync::{HoldKind, SessionOutcome, SyncEvent};
use rstest::rstest;
use std::time::Duration;

#[tokio::test]
async fn test_idempotent_reapply() {
    let harness = Harness::new(fast()).await;
    let snapshot = snapshot_with_title("Hero");
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot.clone()).unwrap();
    assert_eq!(first.await.unwrap(), SessionOutcome::Applied(1));
    for _ in 0..3 {
        let again = harness.registry.receive_snapshot(&harness.peer, snapshot.clone()).unwrap();
        assert_eq!(again.await.unwrap(), SessionOutcome::NoChanges);
    }
    assert_eq!(harness.log.apply_count(), 1);
}

#[rstest]
#[case::serialized(mirage_sync::ApplyOrdering::Serialized)]
#[case::concurrent(mirage_sync::ApplyOrdering::Concurrent)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_applies_never_overlap(#[case] ordering: mirage_sync::ApplyOrdering) {
    let settings = mirage_sync::ApplicationSettings { ordering, ..fast() };
    let harness = Harness::build(settings, |adapter| adapter.with_delay(Duration::from_millis(3))).await;

    let mut sessions = Vec::new();
    for i in 0..20 {
        let snapshot = snapshot_with_title(&format!("Title {i}"));
        sessions.push(harness.registry.receive_snapshot(&harness.peer, snapshot).unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let outcomes: Vec<_> = futures::future::join_all(sessions).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(harness.log.overlaps(), 0);
    // The last snapshot always wins.
    assert!(matches!(outcomes.last(), Some(SessionOutcome::Applied(_))));
    let coordinator = harness.registry.peer(&harness.peer).unwrap().coordinator().clone();
    assert_eq!(coordinator.baseline(), Some(snapshot_with_title("Title 19")));
}

#[tokio::test]
async fn test_hold_balance_replays_once() {
    let mut harness = Harness::new(fast()).await;
    let first = harness.registry.receive_snapshot(&harness.peer, snapshot_with_title("Hero")).unwrap();
    first.await.unwrap();

    let guards: Vec<_> = (0..5)
        .map(|i| {
            let kind = if i % 2 == 0 { HoldKind::Download } else { HoldKind::Application };
            harness.registry.hold(&harness.peer, kind, format!("reason {i}"), 1).unwrap()
        })
        .collect();
    harness.drain_events();

    let mut replays = 0;
    for guard in guards {
        if guard.release() {
            replays += 1;
        }
    }
    assert_eq!(replays, 1);
    assert!(harness.registry.hold_reasons(&harness.peer).is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let finished = harness
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::SessionFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn test_unresolvable_content_stops_at_attempt_bound() {
    let harness = Harness::new(fast()).await;
    // Never published by the remote.
    let hash = mirage_model::ContentHash::of(b"nobody has this");

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

    assert_eq!(outcome, SessionOutcome::ContentUnavailable(1));
    assert_eq!(harness.remote.query_count(), fast().max_attempts as usize);
    assert_eq!(harness.log.apply_count(), 0);
}

#[tokio::test]
async fn test_forbidden_content_stops_early() {
    let harness = Harness::new(fast()).await;
    let hash = harness.remote.add(b"refused".to_vec());
    harness.remote.refuse(&hash);

    let session = harness.registry.receive_snapshot(&harness.peer, snapshot_with_file(&hash)).unwrap();
    assert_eq!(session.await.unwrap(), SessionOutcome::ContentUnavailable(1));
    assert_eq!(harness.remote.query_count(), 1);
}

#[tokio::test]
async fn test_diff_locality() {
    let harness = Harness::new(fast()).await;
    harness.target.show(&harness.peer, ObjectKind::Pet);
    let hash = harness.remote.add(b"body".to_vec());
    let base = mirage_model::SnapshotBuilder::new()
        .file(ObjectKind::Player, common::player_file("chara/body.tex", &hash))
        .blob(ObjectKind::Player, Capability::Title, "Hero")
        .blob(ObjectKind::Pet, Capability::PetNickname, "Carbuncle");
    let first = harness.registry.receive_snapshot(&harness.peer, base.clone().finalize().unwrap()).unwrap();
    first.await.unwrap();
    harness.log.clear();

    let changed = base.clone().blob(ObjectKind::Player, Capability::Title, "Villain");
    let second = harness.registry.receive_snapshot(&harness.peer, changed.clone().finalize().unwrap()).unwrap();
    assert_eq!(second.await.unwrap(), SessionOutcome::Applied(1));
    let applies = harness.log.applies();
    assert_eq!(applies.len(), 1);
    assert!(matches!(&applies[0], Recorded::Apply { kind: ObjectKind::Player, capability: Capability::Title, .. }));
    harness.log.clear();

    // A change on another object leaves the player alone.
    let renamed = changed.blob(ObjectKind::Pet, Capability::PetNickname, "Ruby").finalize().unwrap();
    let third = harness.registry.receive_snapshot(&harness.peer, renamed).unwrap();
    assert_eq!(third.await.unwrap(), SessionOutcome::Applied(1));
    let applies = harness.log.applies();
    assert_eq!(applies.len(), 1);
    assert!(matches!(&applies[0], Recorded::Apply { kind: ObjectKind::Pet, capability: Capability::PetNickname, .. }));
}
