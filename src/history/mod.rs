//! Operation log with an undo/redo cursor over immutable snapshots.
//!
//! Undo and redo only move the cursor and fetch an already persisted
//! snapshot; transformations are never re-executed to reach a history point.

pub mod controller;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use controller::HistoryController;
pub use snapshot::Snapshot;

use crate::engine::{Operation, OperationType};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sequence number of the snapshot copied from the source dataset
pub const BASE_SEQUENCE: u64 = 0;

/// One applied transformation and the snapshot it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub sequence_number: u64,
    pub operation: Operation,
    pub resulting_snapshot_id: u64,
    pub snapshot_checksum: String,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl OperationRecord {
    pub fn operation_type(&self) -> OperationType {
        self.operation.operation_type()
    }
}

/// Ordered operation records plus the cursor into them.
///
/// `position` counts the records currently materialized: `0` is the original
/// dataset, `operations.len()` is the tip. Records at or beyond `position`
/// form the redo branch. Sequence numbers strictly increase and are never
/// reused, even after the redo branch is pruned. A persisted history that
/// fails [`History::integrity_issues`] is rejected on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HistoryParts")]
pub struct History {
    operations: Vec<OperationRecord>,
    position: usize,
    next_sequence: u64,
    base_checksum: String,
}

impl History {
    pub fn new(base_checksum: String) -> Self {
        Self {
            operations: Vec::new(),
            position: 0,
            next_sequence: BASE_SEQUENCE + 1,
            base_checksum,
        }
    }

    pub fn operations(&self) -> &[OperationRecord] {
        &self.operations
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Index of the materialized record, `-1` for the original dataset
    pub fn cursor(&self) -> i64 {
        self.position as i64 - 1
    }

    /// Number of operations reflected in the current snapshot
    pub fn operations_count(&self) -> usize {
        self.position
    }

    pub fn can_undo(&self) -> bool {
        self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        self.position < self.operations.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn base_checksum(&self) -> &str {
        &self.base_checksum
    }

    /// Sequence number of the materialized snapshot
    pub fn current_sequence(&self) -> u64 {
        match self.position {
            0 => BASE_SEQUENCE,
            n => self.operations[n - 1].sequence_number,
        }
    }

    pub fn current_checksum(&self) -> &str {
        match self.position {
            0 => &self.base_checksum,
            n => &self.operations[n - 1].snapshot_checksum,
        }
    }

    pub fn active_records(&self) -> &[OperationRecord] {
        &self.operations[..self.position]
    }

    pub fn redo_branch(&self) -> &[OperationRecord] {
        &self.operations[self.position..]
    }

    /// Every snapshot sequence the history refers to, base first
    pub fn referenced_sequences(&self) -> Vec<u64> {
        std::iter::once(BASE_SEQUENCE)
            .chain(self.operations.iter().map(|r| r.resulting_snapshot_id))
            .collect()
    }

    pub fn checksum_for(&self, sequence: u64) -> Option<&str> {
        if sequence == BASE_SEQUENCE {
            return Some(&self.base_checksum);
        }
        self.operations
            .iter()
            .find(|r| r.resulting_snapshot_id == sequence)
            .map(|r| r.snapshot_checksum.as_str())
    }

    /// Active record previously applied with this idempotency key
    pub fn find_idempotent(&self, key: &str) -> Option<&OperationRecord> {
        self.active_records()
            .iter()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
    }

    /// Append a record at the cursor, pruning the redo branch first.
    ///
    /// Returns the snapshot sequences that were discarded.
    pub fn append(&mut self, record: OperationRecord) -> Result<Vec<u64>> {
        if record.sequence_number < self.next_sequence {
            return Err(EngineError::Conflict(format!(
                "stale sequence number {} (next is {})",
                record.sequence_number, self.next_sequence
            )));
        }
        if record.resulting_snapshot_id != record.sequence_number {
            return Err(EngineError::Corrupted(format!(
                "record {} points at snapshot {}",
                record.sequence_number, record.resulting_snapshot_id
            )));
        }

        let pruned = self
            .operations
            .drain(self.position..)
            .map(|r| r.resulting_snapshot_id)
            .collect();

        self.next_sequence = record.sequence_number + 1;
        self.operations.push(record);
        self.position = self.operations.len();
        Ok(pruned)
    }

    /// Step the cursor back, returning the sequence now materialized
    pub fn undo(&mut self) -> Result<u64> {
        if !self.can_undo() {
            return Err(EngineError::NoOp("undo"));
        }
        self.position -= 1;
        Ok(self.current_sequence())
    }

    /// Step the cursor forward, returning the sequence now materialized
    pub fn redo(&mut self) -> Result<u64> {
        if !self.can_redo() {
            return Err(EngineError::NoOp("redo"));
        }
        self.position += 1;
        Ok(self.current_sequence())
    }

    /// Structural self-check used by recovery
    pub fn integrity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.position > self.operations.len() {
            issues.push(format!(
                "cursor position {} is past {} operations",
                self.position,
                self.operations.len()
            ));
        }

        let mut previous = BASE_SEQUENCE;
        for record in &self.operations {
            if record.sequence_number <= previous {
                issues.push(format!(
                    "sequence number {} does not increase after {}",
                    record.sequence_number, previous
                ));
            }
            if record.resulting_snapshot_id != record.sequence_number {
                issues.push(format!(
                    "record {} points at snapshot {}",
                    record.sequence_number, record.resulting_snapshot_id
                ));
            }
            previous = record.sequence_number;
        }

        if self.next_sequence <= previous {
            issues.push(format!(
                "next sequence {} would reuse {}",
                self.next_sequence, previous
            ));
        }

        issues
    }

    /// Rebuild a history from imported parts
    pub(crate) fn from_parts(
        operations: Vec<OperationRecord>,
        position: usize,
        base_checksum: String,
    ) -> Self {
        let next_sequence = operations
            .last()
            .map(|r| r.sequence_number + 1)
            .unwrap_or(BASE_SEQUENCE + 1);
        Self {
            operations,
            position,
            next_sequence,
            base_checksum,
        }
    }
}

#[derive(Deserialize)]
struct HistoryParts {
    operations: Vec<OperationRecord>,
    position: usize,
    next_sequence: u64,
    base_checksum: String,
}

impl TryFrom<HistoryParts> for History {
    type Error = String;

    fn try_from(parts: HistoryParts) -> std::result::Result<Self, Self::Error> {
        let history = History {
            operations: parts.operations,
            position: parts.position,
            next_sequence: parts.next_sequence,
            base_checksum: parts.base_checksum,
        };
        let issues = history.integrity_issues();
        if issues.is_empty() {
            Ok(history)
        } else {
            Err(issues.join("; "))
        }
    }
}
