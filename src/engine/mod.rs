//! Validation and application of table operations.
//!
//! The engine is pure: it takes the materialized snapshot and an
//! [`Operation`] and produces the next snapshot plus the record describing
//! it. Persistence and history bookkeeping are left to the caller.

pub mod coerce;
pub mod operation;
pub mod transform;


pub use operation::{EncodeMethod, FillStrategy, Operation, OperationType, Scalar, ScaleMethod};

use crate::codec::SnapshotCodec;
use crate::error::{Result, ValidationError};
use crate::history::{OperationRecord, Snapshot};
use crate::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the columns a single one-hot encode may generate per source column
    pub max_one_hot_categories: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_one_hot_categories: 64,
        }
    }
}

/// Result of a successful application: the new snapshot, its encoded frame
/// and the record that goes into history.
#[derive(Debug, Clone)]
pub struct Applied {
    pub snapshot: Snapshot,
    pub record: OperationRecord,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OperationEngine {
    config: EngineConfig,
    codec: SnapshotCodec,
}

impl OperationEngine {
    pub fn new(config: EngineConfig, codec: SnapshotCodec) -> Self {
        Self { config, codec }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &SnapshotCodec {
        &self.codec
    }

    /// Check `operation` against the schema and contents of `table`
    pub fn validate(
        &self,
        table: &Table,
        operation: &Operation,
    ) -> std::result::Result<(), ValidationError> {
        self.transform(table, operation).map(|_| ())
    }

    pub fn transform(
        &self,
        table: &Table,
        operation: &Operation,
    ) -> std::result::Result<Table, ValidationError> {
        match operation {
            Operation::RenameColumn { from, to } => transform::rename_column(table, from, to),
            Operation::ChangeType { column, target } => {
                transform::change_type(table, column, *target)
            }
            Operation::FillMissing {
                columns,
                strategy,
                value,
            } => transform::fill_missing(table, columns, *strategy, value.as_ref()),
            Operation::DeleteColumns { columns } => transform::delete_columns(table, columns),
            Operation::NanCleanup {
                remove_rows,
                remove_columns,
                threshold,
            } => transform::nan_cleanup(table, *remove_rows, *remove_columns, *threshold),
            Operation::Scale { columns, method } => transform::scale(table, columns, *method),
            Operation::Encode { columns, method } => {
                transform::encode(table, columns, *method, self.config.max_one_hot_categories)
            }
            Operation::DropDuplicates { columns } => {
                transform::drop_duplicates(table, columns.as_deref())
            }
        }
    }

    /// Apply `operation` to `current`, producing snapshot `sequence`
    pub fn apply(
        &self,
        current: &Snapshot,
        operation: &Operation,
        sequence: u64,
        applied_at: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> Result<Applied> {
        let table = self.transform(current.table(), operation)?;
        let snapshot = Snapshot::new(current.session_id(), sequence, table);
        let bytes = self.codec.encode(&snapshot)?;
        let snapshot_checksum = SnapshotCodec::checksum(&bytes);

        debug!(
            "Applied {} to session {} as snapshot {}",
            operation.operation_type(),
            current.session_id(),
            sequence
        );

        let record = OperationRecord {
            sequence_number: sequence,
            operation: operation.clone(),
            resulting_snapshot_id: sequence,
            snapshot_checksum,
            applied_at,
            idempotency_key,
        };

        Ok(Applied {
            snapshot,
            record,
            bytes,
        })
    }
}

impl Default for OperationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default(), SnapshotCodec::default())
    }
}
