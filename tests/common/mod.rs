#![allow(dead_code)]

use chrono::Utc;
use std::sync::Arc;
use wrangle::engine::{FillStrategy, Scalar};
use wrangle::{
    Column, ColumnData, InMemoryCatalog, ManualClock, MemoryStore, Operation, SessionManager,
    SessionManagerConfig, Table,
};

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub manager: SessionManager,
}

impl Harness {
    pub fn new(config: SessionManagerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert("people", people());
        let manager = SessionManager::new(config, store.clone(), catalog.clone(), clock.clone());
        Self {
            clock,
            store,
            catalog,
            manager,
        }
    }

    /// A second manager over the same store, catalog and clock
    pub fn peer(&self, config: SessionManagerConfig) -> SessionManager {
        SessionManager::new(
            config,
            self.store.clone(),
            self.catalog.clone(),
            self.clock.clone(),
        )
    }
}

pub fn people() -> Table {
    Table::new(vec![
        Column::new("age", ColumnData::Integer(vec![Some(30), None, Some(41)])),
        Column::new(
            "name",
            ColumnData::Text(vec![Some("ada".into()), None, Some("grace".into())]),
        ),
    ])
    .unwrap()
}

pub fn rename(from: &str, to: &str) -> Operation {
    Operation::RenameColumn {
        from: from.to_string(),
        to: to.to_string(),
    }
}

pub fn fill_unknown(column: &str) -> Operation {
    Operation::FillMissing {
        columns: vec![column.to_string()],
        strategy: FillStrategy::Constant,
        value: Some(Scalar::Text("unknown".to_string())),
    }
}

pub fn text_values(table: &Table, column: &str) -> Vec<Option<String>> {
    match &table.column(column).unwrap().data {
        ColumnData::Text(values) => values.clone(),
        other => panic!("expected a text column, got {:?}", other.column_type()),
    }
}
