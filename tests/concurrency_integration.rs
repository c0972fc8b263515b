mod common;

use common::{Harness, fill_unknown, rename};
use std::collections::HashSet;
use std::time::Duration;
use wrangle::session::ApplyRequest;
use wrangle::{EngineError, InitRequest, MutationOutcome, SessionManagerConfig};

fn successes(results: &[wrangle::Result<MutationOutcome>]) -> Vec<u64> {
    results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|o| o.sequence))
        .collect()
}

#[tokio::test]
async fn test_concurrent_applies_through_one_manager_are_serialized() {
    let h = Harness::new(SessionManagerConfig::default());
    h.store.set_latency(Some(Duration::from_millis(2)));
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.manager.apply(session.id, rename("age", "years").into()),
        h.manager.apply(session.id, fill_unknown("name").into()),
    );
    let results = vec![a, b];

    let sequences = successes(&results);
    assert_eq!(sequences.len(), 2, "both applies should succeed one after the other");
    assert_ne!(sequences[0], sequences[1]);

    let history = h.manager.history(session.id).await.unwrap();
    assert_eq!(history.operations_count(), 2);
}

#[tokio::test]
async fn test_concurrent_applies_across_managers_never_share_a_sequence() {
    let h = Harness::new(SessionManagerConfig::default());
    h.store.set_latency(Some(Duration::from_millis(2)));
    let peer = h.peer(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.manager.apply(session.id, rename("age", "years").into()),
        peer.apply(session.id, fill_unknown("name").into()),
    );
    let results = vec![a, b];

    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, EngineError::Conflict(_)), "unexpected error: {e}");
        }
    }

    let sequences = successes(&results);
    assert!(!sequences.is_empty());
    let unique: HashSet<u64> = sequences.iter().copied().collect();
    assert_eq!(unique.len(), sequences.len());

    let history = h.manager.history(session.id).await.unwrap();
    assert_eq!(history.operations_count(), sequences.len());
    let recorded: HashSet<u64> = history.operations().iter().map(|r| r.sequence_number).collect();
    assert_eq!(recorded, unique);
}

#[tokio::test]
async fn test_concurrent_initialize_for_same_owner_and_dataset() {
    let h = Harness::new(SessionManagerConfig::default());
    h.store.set_latency(Some(Duration::from_millis(2)));
    let peer = h.peer(SessionManagerConfig::default());

    let (a, b) = tokio::join!(
        h.manager.initialize(InitRequest::new("people", "analyst")),
        peer.initialize(InitRequest::new("people", "analyst")),
    );

    let created = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(created, 1, "exactly one session may own the slot");
    let failure = if a.is_err() { a } else { b };
    assert!(matches!(failure, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn test_retried_apply_with_key_applies_once() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    let request = ApplyRequest::with_key(rename("age", "years"), "req-1");
    let first = h.manager.apply(session.id, request.clone()).await.unwrap();
    let second = h.manager.apply(session.id, request).await.unwrap();

    assert_eq!(first.sequence, second.sequence);
    assert_eq!(second.operations_count, 1);
}
