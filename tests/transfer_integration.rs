mod common;

use common::{Harness, fill_unknown, people, rename};
use std::fs;
use tempfile::TempDir;
use wrangle::engine::ScaleMethod;
use wrangle::session::SaveMode;
use wrangle::{
    Column, ColumnData, DatasetRef, EngineError, ExportMode, ImportOptions, InitRequest, Operation,
    OwnerId, SessionDocument, SessionManagerConfig, SessionState, Table,
};

/// Session with rename + fill applied and the fill undone
async fn prepared(h: &Harness) -> wrangle::SessionId {
    let session = h
        .manager
        .initialize(InitRequest::new("people", "analyst"))
        .await
        .unwrap();
    h.manager.apply(session.id, rename("age", "years").into()).await.unwrap();
    h.manager.apply(session.id, fill_unknown("name").into()).await.unwrap();
    h.manager.undo(session.id).await.unwrap();
    session.id
}

#[tokio::test]
async fn test_export_import_operation_log() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let before = h.manager.status(source_id).await.unwrap();

    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();
    assert_eq!(document.position, 1);
    assert_eq!(document.operations.len(), 2);
    // Export is read-only
    assert_eq!(h.manager.status(source_id).await.unwrap(), before);

    let imported = h
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::default())
        .await
        .unwrap();
    assert_ne!(imported.id, source_id);
    assert_eq!(imported.state, SessionState::Active);

    let status = h.manager.status(imported.id).await.unwrap();
    assert_eq!(status.operations_count, 1);
    assert!(status.can_undo);
    assert!(status.can_redo);
    assert_eq!(
        h.manager.current_table(imported.id).await.unwrap(),
        h.manager.current_table(source_id).await.unwrap()
    );

    // The replayed redo branch is live in the new session
    h.manager.redo(imported.id).await.unwrap();
    h.manager.redo(source_id).await.unwrap();
    assert_eq!(
        h.manager.current_table(imported.id).await.unwrap(),
        h.manager.current_table(source_id).await.unwrap()
    );
}

#[tokio::test]
async fn test_export_import_snapshot_only() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;

    let document = h.manager.export(source_id, ExportMode::SnapshotOnly).await.unwrap();
    assert_eq!(document.position, 0);
    assert!(document.operations.is_empty());

    let imported = h
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::default())
        .await
        .unwrap();

    let status = h.manager.status(imported.id).await.unwrap();
    assert_eq!(status.operations_count, 0);
    assert!(!status.can_undo);
    assert!(!status.can_redo);
    let table = h.manager.current_table(imported.id).await.unwrap();
    assert!(table.has_column("years"));
}

#[tokio::test]
async fn test_float_dataset_imports_onto_its_own_source() {
    let h = Harness::new(SessionManagerConfig::default());
    let values = (0..2000)
        .map(|i| {
            let x = i as f64;
            Some(x.sin() * 1e-3 + x * 7.123456789)
        })
        .collect();
    h.catalog.insert(
        "floats",
        Table::new(vec![Column::new("x", ColumnData::Float(values))]).unwrap(),
    );
    let session = h
        .manager
        .initialize(InitRequest::new("floats", "analyst"))
        .await
        .unwrap();
    h.manager
        .apply(
            session.id,
            Operation::Scale {
                columns: vec!["x".to_string()],
                method: ScaleMethod::Standard,
            }
            .into(),
        )
        .await
        .unwrap();

    let document = h.manager.export(session.id, ExportMode::OperationLog).await.unwrap();
    let imported = h
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(
        h.manager.current_table(imported.id).await.unwrap(),
        h.manager.current_table(session.id).await.unwrap()
    );
}

#[tokio::test]
async fn test_import_for_active_owner_needs_force() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();

    let result = h
        .manager
        .import(&document, OwnerId::new("analyst"), ImportOptions::default())
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    let options = ImportOptions {
        force: true,
        ..Default::default()
    };
    let imported = h
        .manager
        .import(&document, OwnerId::new("analyst"), options)
        .await
        .unwrap();
    assert_eq!(
        h.manager.status(source_id).await.unwrap().state,
        SessionState::Closed
    );
    assert_eq!(
        h.manager.status(imported.id).await.unwrap().operations_count,
        1
    );
}

#[tokio::test]
async fn test_import_into_changed_dataset_is_rejected() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();

    // Same name, different contents
    let other = Harness::new(SessionManagerConfig::default());
    let mut changed = people().into_columns();
    changed[0] = Column::new("age", ColumnData::Integer(vec![Some(1), Some(2), Some(3)]));
    other.catalog.insert("people", Table::new(changed).unwrap());

    let result = other
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::default())
        .await;
    assert!(matches!(result, Err(EngineError::DatasetMismatch { .. })));
}

#[tokio::test]
async fn test_import_onto_other_dataset_requires_remap() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();
    let target = h.catalog.insert("people_2025", people());

    let options = ImportOptions {
        dataset_ref: Some(target.clone()),
        ..Default::default()
    };
    let result = h
        .manager
        .import(&document, OwnerId::new("reviewer"), options)
        .await;
    assert!(matches!(result, Err(EngineError::DatasetMismatch { .. })));

    let imported = h
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::remap(target.clone()))
        .await
        .unwrap();
    assert_eq!(imported.dataset_ref, target);
    assert_eq!(
        h.manager.status(imported.id).await.unwrap().operations_count,
        1
    );
}

#[tokio::test]
async fn test_import_fails_on_operations_that_do_not_replay() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();

    // The rename cannot apply to a dataset without an `age` column
    let target = h.catalog.insert(
        "labels",
        Table::new(vec![Column::new(
            "name",
            ColumnData::Text(vec![Some("x".into())]),
        )])
        .unwrap(),
    );
    let result = h
        .manager
        .import(&document, OwnerId::new("reviewer"), ImportOptions::remap(target))
        .await;
    assert!(matches!(result, Err(EngineError::Corrupted(_))));
}

#[tokio::test]
async fn test_document_file_round_trip() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let document = h.manager.export(source_id, ExportMode::OperationLog).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.json");
    fs::write(&path, document.to_bytes().unwrap()).unwrap();

    let loaded = SessionDocument::from_bytes(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded, document);
    assert_eq!(loaded.dataset_ref(), &DatasetRef::new("people"));
}

#[tokio::test]
async fn test_document_rejects_unknown_version_and_garbage() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;
    let mut document = h.manager.export(source_id, ExportMode::SnapshotOnly).await.unwrap();
    document.version = 99;

    let err = SessionDocument::from_bytes(&document.to_bytes().unwrap()).unwrap_err();
    assert!(err.is_unsupported_version());
    assert!(matches!(
        SessionDocument::from_bytes(b"{\"not\": \"a document\"}"),
        Err(EngineError::Codec(_))
    ));
}

#[tokio::test]
async fn test_save_creates_dataset_and_closes() {
    let h = Harness::new(SessionManagerConfig::default());
    let source_id = prepared(&h).await;

    let saved = h
        .manager
        .save(source_id, "people_clean", SaveMode::Close)
        .await
        .unwrap();
    assert!(h.catalog.contains(&saved));
    assert_eq!(
        h.manager.status(source_id).await.unwrap().state,
        SessionState::Closed
    );

    // The saved dataset can seed a new session
    let next = h
        .manager
        .initialize(InitRequest::new(saved.as_str(), "analyst"))
        .await
        .unwrap();
    let table = h.manager.current_table(next.id).await.unwrap();
    assert!(table.has_column("years"));
}
