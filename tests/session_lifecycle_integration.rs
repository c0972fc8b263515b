mod common;

use common::{Harness, fill_unknown, rename, text_values};
use wrangle::env;
use wrangle::session::SessionStore;
use wrangle::{
    ColumnType, DatasetCatalog, DatasetRef, EngineError, InitRequest, Operation,
    SessionManagerConfig,
};

#[tokio::test]
async fn test_rename_fill_undo_redo_scenario() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    h.manager.apply(session.id, rename("age", "years").into()).await.unwrap();
    let outcome = h.manager.apply(session.id, fill_unknown("name").into()).await.unwrap();
    assert_eq!(outcome.operations_count, 2);
    assert_eq!(h.manager.status(session.id).await.unwrap().operations_count, 2);

    let outcome = h.manager.undo(session.id).await.unwrap();
    assert_eq!(outcome.operations_count, 1);
    assert!(outcome.can_redo);
    let table = h.manager.current_table(session.id).await.unwrap();
    assert!(table.has_column("years"));
    assert!(!table.has_column("age"));
    assert_eq!(
        text_values(&table, "name"),
        vec![Some("ada".to_string()), None, Some("grace".to_string())]
    );

    let outcome = h.manager.redo(session.id).await.unwrap();
    assert_eq!(outcome.operations_count, 2);
    let table = h.manager.current_table(session.id).await.unwrap();
    assert_eq!(
        text_values(&table, "name"),
        vec![
            Some("ada".to_string()),
            Some("unknown".to_string()),
            Some("grace".to_string())
        ]
    );
}

#[tokio::test]
async fn test_failed_type_change_leaves_history_untouched() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();
    h.manager.apply(session.id, rename("age", "years").into()).await.unwrap();
    let before = h.manager.history(session.id).await.unwrap();

    let result = h
        .manager
        .apply(
            session.id,
            Operation::ChangeType {
                column: "years".to_string(),
                target: ColumnType::Datetime,
            }
            .into(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let status = h.manager.status(session.id).await.unwrap();
    assert_eq!(status.operations_count, 1);
    assert_eq!(h.manager.history(session.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_apply_after_undo_prunes_redo_branch() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();
    let id = session.id.to_string();

    h.manager.apply(session.id, rename("age", "years").into()).await.unwrap();
    h.manager.apply(session.id, fill_unknown("name").into()).await.unwrap();
    h.manager.undo(session.id).await.unwrap();

    let outcome = h.manager.apply(session.id, rename("name", "label").into()).await.unwrap();
    // Sequence 2 belonged to the pruned fill and is not reused
    assert_eq!(outcome.sequence, 3);
    assert!(!outcome.can_redo);
    assert!(matches!(
        h.manager.redo(session.id).await,
        Err(EngineError::NoOp(_))
    ));

    let history = h.manager.history(session.id).await.unwrap();
    let sequences: Vec<u64> = history.operations().iter().map(|r| r.sequence_number).collect();
    assert_eq!(sequences, vec![1, 3]);
    assert!(
        h.store
            .get(&env::session_snapshot_key(&id, 2))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_undo_at_base_is_noop() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    assert!(matches!(
        h.manager.undo(session.id).await,
        Err(EngineError::NoOp(_))
    ));
    assert!(matches!(
        h.manager.redo(session.id).await,
        Err(EngineError::NoOp(_))
    ));
    let status = h.manager.status(session.id).await.unwrap();
    assert_eq!(status.operations_count, 0);
    assert!(!status.can_undo);
}

#[tokio::test]
async fn test_redo_restores_identical_snapshot_bytes() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();
    let key = env::session_snapshot_key(&session.id.to_string(), 1);

    h.manager.apply(session.id, fill_unknown("name").into()).await.unwrap();
    let table_before = h.manager.current_table(session.id).await.unwrap();
    let bytes_before = h.store.get(&key).await.unwrap().unwrap().value;

    h.manager.undo(session.id).await.unwrap();
    h.manager.redo(session.id).await.unwrap();

    let bytes_after = h.store.get(&key).await.unwrap().unwrap().value;
    assert_eq!(bytes_before, bytes_after);
    assert_eq!(h.manager.current_table(session.id).await.unwrap(), table_before);
}

#[tokio::test]
async fn test_source_dataset_is_never_modified() {
    let h = Harness::new(SessionManagerConfig::default());
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();

    h.manager
        .apply(
            session.id,
            Operation::DeleteColumns {
                columns: vec!["name".to_string()],
            }
            .into(),
        )
        .await
        .unwrap();

    let source = h
        .catalog
        .fetch(&DatasetRef::new("people"))
        .await
        .unwrap();
    assert_eq!(source, common::people());
}
