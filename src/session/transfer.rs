//! Portable session documents.
//!
//! A [`SessionDocument`] carries the session metadata, optionally the full
//! operation log, and the table at the cursor. It is plain JSON data; import
//! rebuilds snapshots locally instead of trusting encoded frames.

use crate::codec::{CodecError, SnapshotCodec};
use crate::engine::OperationEngine;
use crate::error::{EngineError, Result};
use crate::history::{BASE_SEQUENCE, History, OperationRecord, Snapshot};
use crate::session::metadata::{DatasetRef, Session, SessionId};
use crate::session::persistence::to_json_bytes;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Document type marker
pub const DOCUMENT_FORMAT: &str = "wrangle.session";

/// Current document version
pub const DOCUMENT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Every operation, including the redo branch, for replay on import
    #[default]
    #[serde(alias = "log")]
    OperationLog,
    /// Only the materialized table; the imported session starts a fresh history
    #[serde(alias = "snapshot")]
    SnapshotOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub format: String,
    pub version: u16,
    pub mode: ExportMode,
    pub metadata: Session,
    /// SHA-256 of the source dataset the session started from
    pub dataset_fingerprint: String,
    pub position: usize,
    #[serde(default)]
    pub operations: Vec<OperationRecord>,
    pub current_snapshot: Table,
}

impl SessionDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_json_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let document: SessionDocument = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Codec(CodecError::Malformed(e.to_string())))?;
        document.check_format()?;
        Ok(document)
    }

    fn check_format(&self) -> Result<()> {
        if self.format != DOCUMENT_FORMAT {
            return Err(EngineError::Codec(CodecError::Malformed(format!(
                "not a session document: format '{}'",
                self.format
            ))));
        }
        if self.version != DOCUMENT_VERSION {
            return Err(EngineError::Codec(CodecError::UnsupportedVersion {
                found: self.version,
                supported: DOCUMENT_VERSION,
            }));
        }
        Ok(())
    }

    pub fn dataset_ref(&self) -> &DatasetRef {
        &self.metadata.dataset_ref
    }
}

/// Options that control how a document becomes a live session
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Dataset to attach the session to; defaults to the document's own
    pub dataset_ref: Option<DatasetRef>,
    /// Permit `dataset_ref` to differ from the document's dataset
    pub allow_remap: bool,
    /// Close an active session for the same owner and dataset first
    pub force: bool,
    pub ttl_seconds: Option<u64>,
}

impl ImportOptions {
    pub fn remap(dataset_ref: DatasetRef) -> Self {
        Self {
            dataset_ref: Some(dataset_ref),
            allow_remap: true,
            ..Default::default()
        }
    }
}

/// Snapshots and history rebuilt for an imported session
#[derive(Debug)]
pub struct RebuiltSession {
    pub snapshots: Vec<(Snapshot, Vec<u8>)>,
    pub history: History,
}

/// Fingerprint of a source dataset, independent of any session
pub fn dataset_fingerprint(table: &Table) -> Result<String> {
    Ok(SnapshotCodec::checksum(&to_json_bytes(table)?))
}

/// Build the export document for a session
pub fn build_document(
    session: &Session,
    history: &History,
    base: &Snapshot,
    current: &Snapshot,
    mode: ExportMode,
) -> Result<SessionDocument> {
    let (position, operations) = match mode {
        ExportMode::OperationLog => (history.position(), history.operations().to_vec()),
        ExportMode::SnapshotOnly => (0, Vec::new()),
    };
    Ok(SessionDocument {
        format: DOCUMENT_FORMAT.to_string(),
        version: DOCUMENT_VERSION,
        mode,
        metadata: session.clone(),
        dataset_fingerprint: dataset_fingerprint(base.table())?,
        position,
        operations,
        current_snapshot: current.table().clone(),
    })
}

/// Check that `document` may be attached to `target`, whose contents are `source`
pub fn check_dataset(
    document: &SessionDocument,
    target: &DatasetRef,
    source: &Table,
    allow_remap: bool,
) -> Result<bool> {
    let remapped = target != document.dataset_ref();
    if remapped {
        if !allow_remap {
            return Err(EngineError::DatasetMismatch {
                expected: document.dataset_ref().to_string(),
                found: target.to_string(),
            });
        }
        debug!(
            "Remapping imported session from {} to {}",
            document.dataset_ref(),
            target
        );
        return Ok(true);
    }

    let actual = dataset_fingerprint(source)?;
    if actual != document.dataset_fingerprint {
        return Err(EngineError::DatasetMismatch {
            expected: format!("{} ({})", document.dataset_ref(), document.dataset_fingerprint),
            found: format!("{} ({})", target, actual),
        });
    }
    Ok(false)
}

/// Recreate snapshots and history for a new session from `document`.
///
/// In log mode every operation is replayed over `source`; when the dataset
/// was not remapped the table at the document's cursor must equal the
/// exported table exactly.
pub fn rebuild(
    engine: &OperationEngine,
    document: &SessionDocument,
    session_id: SessionId,
    source: Table,
    verify_replay: bool,
) -> Result<RebuiltSession> {
    let codec = engine.codec();

    match document.mode {
        ExportMode::SnapshotOnly => {
            let base = Snapshot::new(session_id, BASE_SEQUENCE, document.current_snapshot.clone());
            let bytes = codec.encode(&base)?;
            let history = History::new(SnapshotCodec::checksum(&bytes));
            Ok(RebuiltSession {
                snapshots: vec![(base, bytes)],
                history,
            })
        }
        ExportMode::OperationLog => {
            if document.position > document.operations.len() {
                return Err(EngineError::Corrupted(format!(
                    "document cursor {} is past {} operations",
                    document.position,
                    document.operations.len()
                )));
            }

            let base = Snapshot::new(session_id, BASE_SEQUENCE, source);
            let base_bytes = codec.encode(&base)?;
            let base_checksum = SnapshotCodec::checksum(&base_bytes);

            let mut records = Vec::with_capacity(document.operations.len());
            let mut snapshots = vec![(base, base_bytes)];
            for (index, exported) in document.operations.iter().enumerate() {
                let sequence = index as u64 + 1;
                let previous = &snapshots[index].0;
                let applied = engine
                    .apply(
                        previous,
                        &exported.operation,
                        sequence,
                        exported.applied_at,
                        exported.idempotency_key.clone(),
                    )
                    .map_err(|e| {
                        EngineError::Corrupted(format!(
                            "operation {} ({}) does not replay: {}",
                            index + 1,
                            exported.operation_type(),
                            e
                        ))
                    })?;
                records.push(applied.record);
                snapshots.push((applied.snapshot, applied.bytes));
            }

            if verify_replay
                && snapshots[document.position].0.table() != &document.current_snapshot
            {
                return Err(EngineError::Corrupted(format!(
                    "replaying {} operations does not reproduce the exported table",
                    document.position
                )));
            }

            info!(
                "Replayed {} operations for imported session {}",
                records.len(),
                session_id
            );
            let history = History::from_parts(records, document.position, base_checksum);
            Ok(RebuiltSession { snapshots, history })
        }
    }
}
