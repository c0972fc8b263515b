use crate::codec::SnapshotCodec;
use crate::env;
use crate::error::{EngineError, Result};
use crate::history::{History, OperationRecord, Snapshot};
use crate::session::metadata::SessionId;
use crate::session::persistence::{BatchWrite, StoreClient, Versioned, WriteBatch, to_json_bytes};
use std::time::Duration;
use tracing::{debug, info};

/// Persists history records and snapshots for sessions.
///
/// The `stage_*` methods add their writes to a caller-owned [`WriteBatch`] so
/// the session manager can commit history, snapshots and session metadata in
/// one atomic step. `append`, `undo` and `redo` are self-contained variants
/// that commit on their own.
#[derive(Clone)]
pub struct HistoryController {
    store: StoreClient,
    codec: SnapshotCodec,
    verify_on_fetch: bool,
}

impl HistoryController {
    pub fn new(store: StoreClient, codec: SnapshotCodec, verify_on_fetch: bool) -> Self {
        Self {
            store,
            codec,
            verify_on_fetch,
        }
    }

    pub fn codec(&self) -> &SnapshotCodec {
        &self.codec
    }

    /// Load the history record with its store version
    pub async fn load(&self, session_id: SessionId) -> Result<Option<Versioned<History>>> {
        self.store
            .get_json(&env::session_history_key(&session_id.to_string()))
            .await
    }

    pub async fn require(&self, session_id: SessionId) -> Result<Versioned<History>> {
        self.load(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("history of session {}", session_id)))
    }

    /// Encode a snapshot, returning the frame and its checksum
    pub fn encode_snapshot(&self, snapshot: &Snapshot) -> Result<(Vec<u8>, String)> {
        let bytes = self.codec.encode(snapshot)?;
        let checksum = SnapshotCodec::checksum(&bytes);
        Ok((bytes, checksum))
    }

    /// Fetch one persisted snapshot, checking it against the recorded checksum
    /// when `verify_on_fetch` is set
    pub async fn fetch_snapshot(
        &self,
        session_id: SessionId,
        sequence: u64,
        expected_checksum: Option<&str>,
    ) -> Result<Snapshot> {
        let expected = expected_checksum.filter(|_| self.verify_on_fetch);
        self.fetch_checked(session_id, sequence, expected).await
    }

    /// Fetch one persisted snapshot and always compare the recorded checksum
    pub async fn fetch_verified(
        &self,
        session_id: SessionId,
        sequence: u64,
        expected_checksum: Option<&str>,
    ) -> Result<Snapshot> {
        self.fetch_checked(session_id, sequence, expected_checksum).await
    }

    async fn fetch_checked(
        &self,
        session_id: SessionId,
        sequence: u64,
        expected_checksum: Option<&str>,
    ) -> Result<Snapshot> {
        let key = env::session_snapshot_key(&session_id.to_string(), sequence);
        let stored = self.store.get(&key).await?.ok_or_else(|| {
            EngineError::Corrupted(format!(
                "snapshot {} of session {} is missing",
                sequence, session_id
            ))
        })?;

        if let Some(expected) = expected_checksum {
            let actual = SnapshotCodec::checksum(&stored.value);
            if actual != expected {
                return Err(EngineError::Corrupted(format!(
                    "snapshot {} of session {} fails its checksum",
                    sequence, session_id
                )));
            }
        }

        let snapshot = self.codec.decode(&stored.value)?;
        if snapshot.session_id() != session_id || snapshot.sequence() != sequence {
            return Err(EngineError::Corrupted(format!(
                "key {} holds snapshot {}:{}",
                key,
                snapshot.session_id(),
                snapshot.sequence()
            )));
        }
        Ok(snapshot)
    }

    /// Snapshot at the cursor of `history`
    pub async fn current_snapshot(
        &self,
        session_id: SessionId,
        history: &History,
    ) -> Result<Snapshot> {
        self.fetch_snapshot(
            session_id,
            history.current_sequence(),
            Some(history.current_checksum()),
        )
        .await
    }

    /// Stage a fresh history whose base is `base` (sequence 0)
    pub fn stage_create(
        &self,
        batch: WriteBatch,
        base: &Snapshot,
    ) -> Result<(WriteBatch, History)> {
        let id = base.session_id().to_string();
        let (bytes, checksum) = self.encode_snapshot(base)?;
        let history = History::new(checksum);
        let batch = batch
            .expect_version(env::session_history_key(&id), None)
            .put(env::session_snapshot_key(&id, base.sequence()), bytes)
            .put(env::session_history_key(&id), to_json_bytes(&history)?);
        Ok((batch, history))
    }

    /// Stage an append at the cursor. Snapshots of the pruned redo branch are
    /// deleted in the same batch.
    pub fn stage_append(
        &self,
        batch: WriteBatch,
        session_id: SessionId,
        current: &Versioned<History>,
        record: OperationRecord,
        snapshot_bytes: Vec<u8>,
    ) -> Result<(WriteBatch, History)> {
        let id = session_id.to_string();
        let mut history = current.value.clone();
        let sequence = record.resulting_snapshot_id;
        let pruned = history.append(record)?;

        if !pruned.is_empty() {
            debug!("Pruning redo branch of session {}: {:?}", session_id, pruned);
        }

        let mut batch = batch
            .expect_version(env::session_history_key(&id), Some(current.version))
            .put(env::session_snapshot_key(&id, sequence), snapshot_bytes);
        for discarded in pruned {
            batch = batch.delete(env::session_snapshot_key(&id, discarded));
        }
        let batch = batch.put(env::session_history_key(&id), to_json_bytes(&history)?);
        Ok((batch, history))
    }

    /// Stage a cursor move one step back
    pub fn stage_undo(
        &self,
        batch: WriteBatch,
        session_id: SessionId,
        current: &Versioned<History>,
    ) -> Result<(WriteBatch, History)> {
        let mut history = current.value.clone();
        history.undo()?;
        self.stage_cursor(batch, session_id, current.version, history)
    }

    /// Stage a cursor move one step forward
    pub fn stage_redo(
        &self,
        batch: WriteBatch,
        session_id: SessionId,
        current: &Versioned<History>,
    ) -> Result<(WriteBatch, History)> {
        let mut history = current.value.clone();
        history.redo()?;
        self.stage_cursor(batch, session_id, current.version, history)
    }

    fn stage_cursor(
        &self,
        batch: WriteBatch,
        session_id: SessionId,
        version: u64,
        history: History,
    ) -> Result<(WriteBatch, History)> {
        let key = env::session_history_key(&session_id.to_string());
        let batch = batch
            .expect_version(key.clone(), Some(version))
            .put(key, to_json_bytes(&history)?);
        Ok((batch, history))
    }

    /// Stage a TTL refresh of every snapshot `history` refers to
    pub fn stage_touch(
        &self,
        mut batch: WriteBatch,
        session_id: SessionId,
        history: &History,
    ) -> WriteBatch {
        let id = session_id.to_string();
        let already_written: Vec<String> = batch
            .writes()
            .iter()
            .filter_map(|w| match w {
                BatchWrite::Put { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        for sequence in history.referenced_sequences() {
            let key = env::session_snapshot_key(&id, sequence);
            if !already_written.contains(&key) {
                batch = batch.touch(key);
            }
        }
        if !already_written.contains(&env::session_history_key(&id)) {
            batch = batch.touch(env::session_history_key(&id));
        }
        batch
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.store.commit(batch).await?;
        Ok(())
    }

    /// Append `record` and its snapshot, refreshing every history key to `ttl`
    pub async fn append(
        &self,
        session_id: SessionId,
        record: OperationRecord,
        snapshot: &Snapshot,
        ttl: Duration,
    ) -> Result<History> {
        let current = self.require(session_id).await?;
        let (bytes, checksum) = self.encode_snapshot(snapshot)?;
        if checksum != record.snapshot_checksum {
            return Err(EngineError::Corrupted(format!(
                "record {} does not describe the snapshot it is appended with",
                record.sequence_number
            )));
        }
        let (batch, history) =
            self.stage_append(WriteBatch::new(Some(ttl)), session_id, &current, record, bytes)?;
        let batch = self.stage_touch(batch, session_id, &history);
        self.commit(batch).await?;
        info!(
            "Appended operation to session {} ({} operations)",
            session_id,
            history.operations_count()
        );
        Ok(history)
    }

    /// Move the cursor back and return the snapshot now materialized
    pub async fn undo(&self, session_id: SessionId, ttl: Duration) -> Result<Snapshot> {
        let current = self.require(session_id).await?;
        let (batch, history) = self.stage_undo(WriteBatch::new(Some(ttl)), session_id, &current)?;
        let snapshot = self.current_snapshot(session_id, &history).await?;
        let batch = self.stage_touch(batch, session_id, &history);
        self.commit(batch).await?;
        Ok(snapshot)
    }

    /// Move the cursor forward and return the snapshot now materialized
    pub async fn redo(&self, session_id: SessionId, ttl: Duration) -> Result<Snapshot> {
        let current = self.require(session_id).await?;
        let (batch, history) = self.stage_redo(WriteBatch::new(Some(ttl)), session_id, &current)?;
        let snapshot = self.current_snapshot(session_id, &history).await?;
        let batch = self.stage_touch(batch, session_id, &history);
        self.commit(batch).await?;
        Ok(snapshot)
    }
}
