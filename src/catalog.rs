//! Dataset catalog collaborator.
//!
//! The catalog owns source datasets. The engine only reads from it when a
//! session is created or imported, and writes to it when a session is saved.

use crate::error::{EngineError, Result};
use crate::session::metadata::DatasetRef;
use crate::table::Table;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Read a dataset; `NotFound` when the reference is unknown
    async fn fetch(&self, dataset_ref: &DatasetRef) -> Result<Table>;

    /// Persist `table` as a new dataset called `name`
    async fn create(&self, name: &str, table: &Table) -> Result<DatasetRef>;
}

/// Catalog held in process memory, keyed by dataset name
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    datasets: DashMap<String, Table>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset directly, replacing any previous one with that name
    pub fn insert(&self, name: impl Into<String>, table: Table) -> DatasetRef {
        let name = name.into();
        self.datasets.insert(name.clone(), table);
        DatasetRef::new(name)
    }

    pub fn contains(&self, dataset_ref: &DatasetRef) -> bool {
        self.datasets.contains_key(dataset_ref.as_str())
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[async_trait]
impl DatasetCatalog for InMemoryCatalog {
    async fn fetch(&self, dataset_ref: &DatasetRef) -> Result<Table> {
        self.datasets
            .get(dataset_ref.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("dataset {}", dataset_ref)))
    }

    async fn create(&self, name: &str, table: &Table) -> Result<DatasetRef> {
        if name.trim().is_empty() {
            return Err(crate::error::ValidationError::InvalidParameter {
                parameter: "name",
                reason: "dataset name must not be empty".to_string(),
            }
            .into());
        }
        match self.datasets.entry(name.to_string()) {
            dashmap::Entry::Occupied(_) => {
                Err(EngineError::Conflict(format!("dataset {} already exists", name)))
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(table.clone());
                info!("Dataset created: {} ({} rows)", name, table.row_count());
                Ok(DatasetRef::new(name))
            }
        }
    }
}
