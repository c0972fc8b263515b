use crate::clock::ManualClock;
use crate::codec::SnapshotCodec;
use crate::engine::{Operation, OperationEngine};
use crate::env;
use crate::error::EngineError;
use crate::history::*;
use crate::session::persistence::{MemoryStore, SessionStore, StoreClient, WriteBatch};
use crate::table::{Column, ColumnData, Table};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(600);

fn create_test_record(sequence: u64) -> OperationRecord {
    OperationRecord {
        sequence_number: sequence,
        operation: Operation::DeleteColumns {
            columns: vec![format!("c{}", sequence)],
        },
        resulting_snapshot_id: sequence,
        snapshot_checksum: format!("checksum-{}", sequence),
        applied_at: Utc::now(),
        idempotency_key: None,
    }
}

fn delete(columns: &[&str]) -> Operation {
    Operation::DeleteColumns {
        columns: columns.iter().map(|c| c.to_string()).collect(),
    }
}

fn create_test_table() -> Table {
    Table::new(vec![
        Column::new("a", ColumnData::Integer(vec![Some(1), Some(2)])),
        Column::new("b", ColumnData::Integer(vec![Some(3), Some(4)])),
        Column::new("c", ColumnData::Integer(vec![Some(5), Some(6)])),
    ])
    .unwrap()
}

fn create_test_controller() -> (Arc<MemoryStore>, HistoryController) {
    create_test_controller_with(true)
}

fn create_test_controller_with(verify_on_fetch: bool) -> (Arc<MemoryStore>, HistoryController) {
    let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::default())));
    let client = StoreClient::new(store.clone(), Duration::from_secs(1));
    (
        store,
        HistoryController::new(client, SnapshotCodec::default(), verify_on_fetch),
    )
}

#[test]
fn test_new_history_is_at_base() {
    let history = History::new("base".to_string());
    assert_eq!(history.position(), 0);
    assert_eq!(history.cursor(), -1);
    assert_eq!(history.current_sequence(), BASE_SEQUENCE);
    assert_eq!(history.current_checksum(), "base");
    assert!(!history.can_undo());
    assert!(!history.can_redo());
    assert!(history.integrity_issues().is_empty());
}

#[test]
fn test_undo_redo_boundaries() {
    let mut history = History::new("base".to_string());
    assert!(matches!(history.undo(), Err(EngineError::NoOp("undo"))));
    assert!(matches!(history.redo(), Err(EngineError::NoOp("redo"))));

    history.append(create_test_record(1)).unwrap();
    history.append(create_test_record(2)).unwrap();
    assert_eq!(history.operations_count(), 2);

    assert_eq!(history.undo().unwrap(), 1);
    assert_eq!(history.operations_count(), 1);
    assert!(history.can_redo());
    assert_eq!(history.redo().unwrap(), 2);
    assert!(matches!(history.redo(), Err(EngineError::NoOp("redo"))));
}

#[test]
fn test_append_prunes_redo_branch() {
    let mut history = History::new("base".to_string());
    for seq in 1..=3 {
        history.append(create_test_record(seq)).unwrap();
    }
    history.undo().unwrap();
    history.undo().unwrap();
    assert_eq!(history.redo_branch().len(), 2);

    let pruned = history.append(create_test_record(4)).unwrap();
    assert_eq!(pruned, vec![2, 3]);
    assert_eq!(history.operations().len(), 2);
    assert_eq!(history.current_sequence(), 4);
    assert!(!history.can_redo());
    assert_eq!(history.referenced_sequences(), vec![0, 1, 4]);
    assert!(history.checksum_for(2).is_none());
}

#[test]
fn test_sequence_numbers_are_never_reused() {
    let mut history = History::new("base".to_string());
    history.append(create_test_record(1)).unwrap();
    history.append(create_test_record(2)).unwrap();
    history.undo().unwrap();

    assert_eq!(history.next_sequence(), 3);
    assert!(matches!(
        history.append(create_test_record(2)),
        Err(EngineError::Conflict(_))
    ));
}

#[test]
fn test_integrity_issues_detect_bad_parts() {
    let mut broken = create_test_record(2);
    broken.resulting_snapshot_id = 7;
    let history = History::from_parts(vec![create_test_record(3), broken], 5, "base".to_string());

    let issues = history.integrity_issues();
    assert_eq!(issues.len(), 3);
}

#[test]
fn test_deserialize_rejects_cursor_past_operations() {
    let mut history = History::new("base".to_string());
    history.append(create_test_record(1)).unwrap();

    let mut value = serde_json::to_value(&history).unwrap();
    value["position"] = serde_json::json!(3);
    let err = serde_json::from_value::<History>(value).unwrap_err();
    assert!(err.to_string().contains("cursor position 3"));

    let round_trip: History =
        serde_json::from_slice(&serde_json::to_vec(&history).unwrap()).unwrap();
    assert_eq!(round_trip, history);
}

#[test]
fn test_find_idempotent_only_sees_active_records() {
    let mut history = History::new("base".to_string());
    let mut record = create_test_record(1);
    record.idempotency_key = Some("k".to_string());
    history.append(record).unwrap();
    assert!(history.find_idempotent("k").is_some());

    history.undo().unwrap();
    assert!(history.find_idempotent("k").is_none());
}

#[tokio::test]
async fn test_controller_append_undo_redo_round_trip() {
    let (store, controller) = create_test_controller();
    let id = Uuid::new_v4();
    let engine = OperationEngine::default();

    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, history) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();
    assert_eq!(history.operations_count(), 0);

    let op = Operation::DeleteColumns {
        columns: vec!["a".to_string()],
    };
    let applied = engine.apply(&base, &op, 1, Utc::now(), None).unwrap();
    let history = controller
        .append(id, applied.record.clone(), &applied.snapshot, TTL)
        .await
        .unwrap();
    assert_eq!(history.operations_count(), 1);

    let stored_before = store
        .get(&env::session_snapshot_key(&id.to_string(), 1))
        .await
        .unwrap()
        .unwrap()
        .value;

    let undone = controller.undo(id, TTL).await.unwrap();
    assert_eq!(undone, base);

    let redone = controller.redo(id, TTL).await.unwrap();
    assert_eq!(redone, applied.snapshot);
    assert_eq!(controller.codec().encode(&redone).unwrap(), stored_before);

    assert!(matches!(
        controller.redo(id, TTL).await,
        Err(EngineError::NoOp("redo"))
    ));
}

#[tokio::test]
async fn test_controller_prunes_snapshot_keys() {
    let (store, controller) = create_test_controller();
    let id = Uuid::new_v4();
    let engine = OperationEngine::default();

    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, _) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();

    let first = engine
        .apply(&base, &delete(&["a"]), 1, Utc::now(), None)
        .unwrap();
    controller.append(id, first.record, &first.snapshot, TTL).await.unwrap();
    let second = engine
        .apply(&first.snapshot, &delete(&["b"]), 2, Utc::now(), None)
        .unwrap();
    controller.append(id, second.record, &second.snapshot, TTL).await.unwrap();

    controller.undo(id, TTL).await.unwrap();
    controller.undo(id, TTL).await.unwrap();

    let third = engine
        .apply(&base, &Operation::DeleteColumns { columns: vec!["c".into()] }, 3, Utc::now(), None)
        .unwrap();
    let history = controller.append(id, third.record, &third.snapshot, TTL).await.unwrap();
    assert_eq!(history.referenced_sequences(), vec![0, 3]);

    let keys = store
        .keys_with_prefix(&format!("session:{}:snapshot:", id))
        .await
        .unwrap();
    assert_eq!(
        keys,
        vec![
            env::session_snapshot_key(&id.to_string(), 0),
            env::session_snapshot_key(&id.to_string(), 3),
        ]
    );
    assert!(matches!(
        controller.redo(id, TTL).await,
        Err(EngineError::NoOp("redo"))
    ));
}

#[tokio::test]
async fn test_fetch_snapshot_detects_corruption() {
    let (store, controller) = create_test_controller();
    let id = Uuid::new_v4();
    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, history) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();

    let other = Snapshot::new(id, BASE_SEQUENCE, Table::default());
    let forged = controller.codec().encode(&other).unwrap();
    assert!(store.corrupt(&env::session_snapshot_key(&id.to_string(), 0), forged));

    assert!(matches!(
        controller.current_snapshot(id, &history).await,
        Err(EngineError::Corrupted(_))
    ));
}

#[tokio::test]
async fn test_append_rejects_record_for_other_snapshot() {
    let (_store, controller) = create_test_controller();
    let id = Uuid::new_v4();
    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, _) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();

    let snapshot = Snapshot::new(id, 1, Table::default());
    assert!(matches!(
        controller.append(id, create_test_record(1), &snapshot, TTL).await,
        Err(EngineError::Corrupted(_))
    ));
}

#[tokio::test]
async fn test_load_rejects_tampered_history() {
    let (store, controller) = create_test_controller();
    let id = Uuid::new_v4();
    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, _) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();

    let key = env::session_history_key(&id.to_string());
    let stored = store.get(&key).await.unwrap().unwrap().value;
    let mut value: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    value["position"] = serde_json::json!(3);
    assert!(store.corrupt(&key, serde_json::to_vec(&value).unwrap()));

    assert!(matches!(
        controller.load(id).await,
        Err(EngineError::Corrupted(_))
    ));
    assert!(matches!(
        controller.undo(id, TTL).await,
        Err(EngineError::Corrupted(_))
    ));
}

#[tokio::test]
async fn test_fetch_verified_ignores_verify_setting() {
    let (store, controller) = create_test_controller_with(false);
    let id = Uuid::new_v4();
    let base = Snapshot::new(id, BASE_SEQUENCE, create_test_table());
    let (batch, history) = controller
        .stage_create(WriteBatch::new(Some(TTL)), &base)
        .unwrap();
    controller.commit(batch).await.unwrap();

    let other = Snapshot::new(id, BASE_SEQUENCE, Table::default());
    let forged = controller.codec().encode(&other).unwrap();
    assert!(store.corrupt(&env::session_snapshot_key(&id.to_string(), 0), forged));

    let fetched = controller.current_snapshot(id, &history).await.unwrap();
    assert_eq!(fetched, other);
    assert!(matches!(
        controller
            .fetch_verified(id, BASE_SEQUENCE, Some(history.base_checksum()))
            .await,
        Err(EngineError::Corrupted(_))
    ));
}
