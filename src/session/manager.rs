use crate::catalog::DatasetCatalog;
use crate::clock::Clock;
use crate::codec::{CodecConfig, SnapshotCodec};
use crate::engine::{EngineConfig, Operation, OperationEngine};
use crate::env;
use crate::error::{EngineError, Result, ValidationError};
use crate::history::{BASE_SEQUENCE, History, HistoryController, Snapshot};
use crate::session::metadata::*;
use crate::session::persistence::*;
use crate::session::recovery::*;
use crate::session::transfer::{self, ExportMode, ImportOptions, SessionDocument};
use crate::table::Table;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Owns session lifecycle and serializes mutations per session.
///
/// All state lives in the store; the manager only keeps per-session locks and
/// a record of the sessions it has seen so that expiry can be reported.
pub struct SessionManager {
    config: SessionManagerConfig,
    store: StoreClient,
    history: HistoryController,
    engine: OperationEngine,
    recovery: RecoveryService,
    catalog: Arc<dyn DatasetCatalog>,
    clock: Arc<dyn Clock>,
    locks: Arc<DashMap<SessionId, Arc<Mutex<()>>>>,
    tracked: Arc<DashMap<SessionId, TrackedSession>>,
    events: broadcast::Sender<SessionEvent>,
    sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Configuration for session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    pub default_ttl_seconds: u64,
    /// Idle time before expiry at which a session is reported as expiring
    pub warning_window_seconds: u64,
    /// How long a stopped session stays recoverable; 0 deletes it at once
    pub closed_grace_seconds: u64,
    pub max_ttl_seconds: u64,
    /// Deadline applied to every store call
    pub store_deadline_ms: u64,
    pub sweep_interval_seconds: u64,
    /// How long a session whose keys are gone keeps reporting its final state
    pub tombstone_seconds: u64,
    pub verify_on_fetch: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 1800,
            warning_window_seconds: 300,
            closed_grace_seconds: 120,
            max_ttl_seconds: 86_400,
            store_deadline_ms: 2000,
            sweep_interval_seconds: 30,
            tombstone_seconds: 600,
            verify_on_fetch: true,
        }
    }
}

impl SessionManagerConfig {
    pub fn store_deadline(&self) -> Duration {
        Duration::from_millis(self.store_deadline_ms)
    }
}

/// Session initialization request
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub dataset_ref: DatasetRef,
    pub owner_id: OwnerId,
    pub ttl_seconds: Option<u64>,
    /// Close an existing active session for the same owner and dataset
    pub force: bool,
}

impl InitRequest {
    pub fn new(dataset_ref: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            dataset_ref: DatasetRef::new(dataset_ref),
            owner_id: OwnerId::new(owner_id),
            ttl_seconds: None,
            force: false,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// One operation to apply, with an optional client token for duplicate detection
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub operation: Operation,
    pub idempotency_key: Option<String>,
}

impl ApplyRequest {
    pub fn with_key(operation: Operation, key: impl Into<String>) -> Self {
        Self {
            operation,
            idempotency_key: Some(key.into()),
        }
    }
}

impl From<Operation> for ApplyRequest {
    fn from(operation: Operation) -> Self {
        Self {
            operation,
            idempotency_key: None,
        }
    }
}

/// Result shape shared by apply, undo and redo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub session_id: SessionId,
    /// Sequence number of the snapshot now materialized
    pub sequence: u64,
    pub operations_count: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    pub expires_at: DateTime<Utc>,
}

impl MutationOutcome {
    fn new(session: &Session, history: &History) -> Self {
        Self {
            session_id: session.id,
            sequence: history.current_sequence(),
            operations_count: history.operations_count(),
            can_undo: history.can_undo(),
            can_redo: history.can_redo(),
            expires_at: session.expires_at(),
        }
    }
}

/// What happens to the session after `save`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    #[default]
    KeepOpen,
    Close,
}

/// Summary of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_keys: usize,
    pub expiring: Vec<SessionId>,
    pub expired: Vec<SessionId>,
}

#[derive(Debug, Clone)]
struct TrackedSession {
    last_activity_at: DateTime<Utc>,
    warned: bool,
    /// Final state once the session's keys are gone, and when that was seen
    gone: Option<(SessionState, DateTime<Utc>)>,
}

impl TrackedSession {
    fn active(last_activity_at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at,
            warned: false,
            gone: None,
        }
    }

    /// Record the final state; the first one recorded wins
    fn mark_gone(&mut self, state: SessionState, now: DateTime<Utc>) -> SessionState {
        self.gone.get_or_insert((state, now)).0
    }

    fn is_live(&self) -> bool {
        self.gone.is_none()
    }
}

/// Live session records loaded for one mutation
struct Loaded {
    session: Versioned<Session>,
    history: Versioned<History>,
    owner_index: Option<u64>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(
        config: SessionManagerConfig,
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn DatasetCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = StoreClient::new(store, config.store_deadline());
        let codec = SnapshotCodec::default();
        let history = HistoryController::new(store.clone(), codec.clone(), config.verify_on_fetch);
        let recovery = RecoveryService::new(store.clone(), history.clone(), clock.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            engine: OperationEngine::new(EngineConfig::default(), codec),
            config,
            store,
            history,
            recovery,
            catalog,
            clock,
            locks: Arc::new(DashMap::new()),
            tracked: Arc::new(DashMap::new()),
            events,
            sweep: std::sync::Mutex::new(None),
        }
    }

    /// Replace codec and engine settings
    pub fn with_components(mut self, codec: CodecConfig, engine: EngineConfig) -> Self {
        let codec = SnapshotCodec::new(codec);
        self.history = HistoryController::new(
            self.store.clone(),
            codec.clone(),
            self.config.verify_on_fetch,
        );
        self.recovery = RecoveryService::new(
            self.store.clone(),
            self.history.clone(),
            self.clock.clone(),
        );
        self.engine = OperationEngine::new(engine, codec);
        self
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn engine(&self) -> &OperationEngine {
        &self.engine
    }

    /// Receive lifecycle events, including expiry warnings from the sweep
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session over a copy of `request.dataset_ref`
    pub async fn initialize(&self, request: InitRequest) -> Result<Session> {
        let ttl_seconds = self.resolve_ttl(request.ttl_seconds)?;
        let table = self.catalog.fetch(&request.dataset_ref).await?;
        let owner_index = self
            .claim_owner_slot(&request.owner_id, &request.dataset_ref, request.force)
            .await?;

        let now = self.clock.now();
        let mut session = Session::new(request.dataset_ref, request.owner_id, ttl_seconds, now);
        session.state = SessionState::Active;

        let base = Snapshot::new(session.id, BASE_SEQUENCE, table);
        let batch = self.stage_new_session(&session, owner_index)?;
        let (batch, _) = self.history.stage_create(batch, &base)?;
        self.store.commit(batch).await?;

        self.track(session.id, now);
        self.emit(SessionEvent::Initialized {
            session_id: session.id,
        });
        info!(
            "Session initialized: {} (dataset {}, owner {}, ttl {}s)",
            session.id, session.dataset_ref, session.owner_id, ttl_seconds
        );
        Ok(session)
    }

    /// Read-only status; never refreshes TTL
    pub async fn status(&self, session_id: SessionId) -> Result<SessionStatus> {
        let session: Option<Versioned<Session>> = self
            .store
            .get_json(&env::session_meta_key(&session_id.to_string()))
            .await?;

        let Some(session) = session else {
            return self.gone_status(session_id);
        };
        let session = session.value;
        let now = self.clock.now();
        let state = session.effective_state(now, self.config.warning_window_seconds);
        if state == SessionState::Expired {
            return self.gone_status(session_id);
        }

        let history = match session.state {
            SessionState::Unrecoverable => None,
            _ => self.history.load(session_id).await?.map(|h| h.value),
        };

        Ok(SessionStatus {
            session_id,
            exists: true,
            state,
            operations_count: history.as_ref().map(History::operations_count).unwrap_or(0),
            can_undo: history.as_ref().is_some_and(History::can_undo),
            can_redo: history.as_ref().is_some_and(History::can_redo),
            last_activity_at: Some(session.last_activity_at),
            expires_at: Some(session.expires_at()),
        })
    }

    /// Validate and apply one operation at the cursor
    pub async fn apply(
        &self,
        session_id: SessionId,
        request: ApplyRequest,
    ) -> Result<MutationOutcome> {
        let _guard = self.lock(session_id).await;
        let loaded = self.load_active(session_id).await?;

        if let Some(key) = request.idempotency_key.as_deref()
            && let Some(record) = loaded.history.value.find_idempotent(key)
        {
            debug!(
                "Session {}: idempotency key {} already applied as {}",
                session_id, key, record.sequence_number
            );
            return Ok(MutationOutcome::new(&loaded.session.value, &loaded.history.value));
        }

        let current = self.history.current_snapshot(session_id, &loaded.history.value).await?;
        let now = self.clock.now();
        let applied = self.engine.apply(
            &current,
            &request.operation,
            loaded.history.value.next_sequence(),
            now,
            request.idempotency_key,
        )?;

        let (session, batch) = self.stage_activity(&loaded, now)?;
        let (batch, history) =
            self.history
                .stage_append(batch, session_id, &loaded.history, applied.record, applied.bytes)?;
        let batch = self.history.stage_touch(batch, session_id, &history);
        self.store.commit(batch).await?;

        self.track(session_id, now);
        info!(
            "Applied {} to session {} (sequence {}, {} operations)",
            request.operation.operation_type(),
            session_id,
            history.current_sequence(),
            history.operations_count()
        );
        Ok(MutationOutcome::new(&session, &history))
    }

    /// Step the cursor back one operation
    pub async fn undo(&self, session_id: SessionId) -> Result<MutationOutcome> {
        let _guard = self.lock(session_id).await;
        let loaded = self.load_active(session_id).await?;
        let now = self.clock.now();

        let (session, batch) = self.stage_activity(&loaded, now)?;
        let (batch, history) = self.history.stage_undo(batch, session_id, &loaded.history)?;
        self.commit_cursor(session_id, batch, &history).await?;

        self.track(session_id, now);
        info!(
            "Undo in session {} (now {} operations)",
            session_id,
            history.operations_count()
        );
        Ok(MutationOutcome::new(&session, &history))
    }

    /// Step the cursor forward one operation
    pub async fn redo(&self, session_id: SessionId) -> Result<MutationOutcome> {
        let _guard = self.lock(session_id).await;
        let loaded = self.load_active(session_id).await?;
        let now = self.clock.now();

        let (session, batch) = self.stage_activity(&loaded, now)?;
        let (batch, history) = self.history.stage_redo(batch, session_id, &loaded.history)?;
        self.commit_cursor(session_id, batch, &history).await?;

        self.track(session_id, now);
        info!(
            "Redo in session {} (now {} operations)",
            session_id,
            history.operations_count()
        );
        Ok(MutationOutcome::new(&session, &history))
    }

    /// Refresh activity and TTL, returning the new expiry
    pub async fn touch(&self, session_id: SessionId) -> Result<DateTime<Utc>> {
        let _guard = self.lock(session_id).await;
        let loaded = self.load_active(session_id).await?;
        let now = self.clock.now();

        let (session, batch) = self.stage_activity(&loaded, now)?;
        let batch = self.history.stage_touch(batch, session_id, &loaded.history.value);
        self.store.commit(batch).await?;

        self.track(session_id, now);
        debug!("Session {} touched, expires at {}", session_id, session.expires_at());
        Ok(session.expires_at())
    }

    /// Lengthen the session's TTL by `extra_seconds`, bounded by `max_ttl_seconds`
    pub async fn extend(&self, session_id: SessionId, extra_seconds: u64) -> Result<DateTime<Utc>> {
        if extra_seconds == 0 {
            return Err(ValidationError::parameter("extra_seconds", "must be positive").into());
        }

        let _guard = self.lock(session_id).await;
        let mut loaded = self.load_active(session_id).await?;
        let now = self.clock.now();

        loaded.session.value.ttl_seconds = loaded
            .session
            .value
            .ttl_seconds
            .saturating_add(extra_seconds)
            .min(self.config.max_ttl_seconds);
        let (session, batch) = self.stage_activity(&loaded, now)?;
        let batch = self.history.stage_touch(batch, session_id, &loaded.history.value);
        self.store.commit(batch).await?;

        self.track(session_id, now);
        info!(
            "Session {} extended to {}s, expires at {}",
            session_id,
            session.ttl_seconds,
            session.expires_at()
        );
        Ok(session.expires_at())
    }

    /// Close the session, keeping its keys for the configured grace period
    pub async fn stop(&self, session_id: SessionId) -> Result<()> {
        {
            let _guard = self.lock(session_id).await;
            self.stop_locked(session_id).await?;
        }
        if self.config.closed_grace_seconds == 0 {
            release_lock(&self.locks, session_id);
        }
        Ok(())
    }

    /// Materialize the table at the cursor as a new catalog dataset
    pub async fn save(
        &self,
        session_id: SessionId,
        name: &str,
        mode: SaveMode,
    ) -> Result<DatasetRef> {
        let _guard = self.lock(session_id).await;
        let loaded = self.load_active(session_id).await?;
        let current = self.history.current_snapshot(session_id, &loaded.history.value).await?;

        let dataset_ref = self.catalog.create(name, current.table()).await?;
        info!(
            "Session {} saved as dataset {} ({} operations)",
            session_id,
            dataset_ref,
            loaded.history.value.operations_count()
        );

        match mode {
            SaveMode::Close => self.stop_locked(session_id).await?,
            SaveMode::KeepOpen => {
                let now = self.clock.now();
                let (_, batch) = self.stage_activity(&loaded, now)?;
                let batch = self.history.stage_touch(batch, session_id, &loaded.history.value);
                self.store.commit(batch).await?;
                self.track(session_id, now);
            }
        }
        Ok(dataset_ref)
    }

    /// Table at the cursor; read-only
    pub async fn current_table(&self, session_id: SessionId) -> Result<Table> {
        let (_, history) = self.load_readable(session_id).await?;
        let snapshot = self.history.current_snapshot(session_id, &history).await?;
        Ok(snapshot.into_table())
    }

    /// Operation log with the cursor; read-only
    pub async fn history(&self, session_id: SessionId) -> Result<History> {
        let (_, history) = self.load_readable(session_id).await?;
        Ok(history)
    }

    /// Verify a persisted session and take it over, reopening it if it was
    /// stopped within its grace period.
    pub async fn recover(&self, session_id: SessionId) -> Result<Session> {
        let _guard = self.lock(session_id).await;
        let report = match self.recovery.recover(session_id).await {
            Ok(report) => report,
            Err(EngineError::Unrecoverable { session_id: id, issues }) => {
                self.emit(SessionEvent::Unrecoverable {
                    session_id,
                    reason: issues.join("; "),
                });
                return Err(EngineError::Unrecoverable { session_id: id, issues });
            }
            Err(e) => return Err(e),
        };

        let mut session = report.session.value.clone();
        let owner_key =
            env::owner_dataset_key(session.owner_id.as_str(), session.dataset_ref.as_str());
        let index: Option<Versioned<SessionId>> = self.store.get_json(&owner_key).await?;
        let now = self.clock.now();

        let mut batch = WriteBatch::new(Some(Duration::from_secs(session.ttl_seconds)));
        match index {
            Some(index) if index.value == session_id => {
                batch = batch
                    .expect_version(owner_key.clone(), Some(index.version))
                    .touch(owner_key);
            }
            Some(index) => {
                return Err(EngineError::Conflict(format!(
                    "owner {} now has session {} on dataset {}",
                    session.owner_id, index.value, session.dataset_ref
                )));
            }
            None => {
                batch = batch
                    .expect_version(owner_key.clone(), None)
                    .put(owner_key, to_json_bytes(&session_id)?);
            }
        }

        if session.state == SessionState::Closed {
            info!("Reopening closed session {}", session_id);
        }
        session.state = SessionState::Active;
        session.touch(now);

        let meta_key = env::session_meta_key(&session_id.to_string());
        let batch = batch
            .expect_version(meta_key.clone(), Some(report.session.version))
            .expect_version(
                env::session_history_key(&session_id.to_string()),
                Some(report.history.version),
            )
            .put(meta_key, to_json_bytes(&session)?);
        let batch = self.history.stage_touch(batch, session_id, &report.history.value);
        self.store.commit(batch).await?;

        self.track(session_id, now);
        info!(
            "Session {} recovered ({} snapshots verified)",
            session_id, report.verified_snapshots
        );
        Ok(session)
    }

    /// Serialize the session into a portable document; read-only
    pub async fn export(&self, session_id: SessionId, mode: ExportMode) -> Result<SessionDocument> {
        let (session, history) = self.load_readable(session_id).await?;
        let base = self
            .history
            .fetch_snapshot(session_id, BASE_SEQUENCE, Some(history.base_checksum()))
            .await?;
        let current = self.history.current_snapshot(session_id, &history).await?;

        let document = transfer::build_document(&session, &history, &base, &current, mode)?;
        info!(
            "Exported session {} ({:?}, {} operations)",
            session_id,
            mode,
            document.operations.len()
        );
        Ok(document)
    }

    /// Create a new session from an exported document
    pub async fn import(
        &self,
        document: &SessionDocument,
        owner_id: OwnerId,
        options: ImportOptions,
    ) -> Result<Session> {
        let target = options
            .dataset_ref
            .clone()
            .unwrap_or_else(|| document.dataset_ref().clone());
        let source = self.catalog.fetch(&target).await?;
        let remapped = transfer::check_dataset(document, &target, &source, options.allow_remap)?;

        let ttl_seconds = self.resolve_ttl(
            options
                .ttl_seconds
                .or(Some(document.metadata.ttl_seconds)),
        )?;
        let now = self.clock.now();
        let mut session = Session::new(target, owner_id, ttl_seconds, now);
        session.state = SessionState::Active;

        let rebuilt = transfer::rebuild(&self.engine, document, session.id, source, !remapped)?;
        let owner_index = self
            .claim_owner_slot(&session.owner_id, &session.dataset_ref, options.force)
            .await?;

        let id = session.id.to_string();
        let mut batch = self
            .stage_new_session(&session, owner_index)?
            .expect_version(env::session_history_key(&id), None);
        for (snapshot, bytes) in rebuilt.snapshots {
            batch = batch.put(env::session_snapshot_key(&id, snapshot.sequence()), bytes);
        }
        let batch = batch.put(env::session_history_key(&id), to_json_bytes(&rebuilt.history)?);
        self.store.commit(batch).await?;

        self.track(session.id, now);
        self.emit(SessionEvent::Initialized {
            session_id: session.id,
        });
        info!(
            "Imported session {} from {} on dataset {} ({} operations, cursor {})",
            session.id,
            document.metadata.id,
            session.dataset_ref,
            rebuilt.history.operations().len(),
            rebuilt.history.position()
        );
        Ok(session)
    }

    /// Start the periodic expiry sweep
    pub fn start_expiry_sweep(&self) -> Result<()> {
        let interval_duration = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        let sweeper = self.sweeper();

        let handle = tokio::spawn(async move {
            let mut interval_timer = interval(interval_duration);

            loop {
                interval_timer.tick().await;

                match sweeper.sweep_once().await {
                    Ok(report) => {
                        if report.purged_keys > 0 || !report.expired.is_empty() {
                            debug!(
                                "Expiry sweep purged {} keys, {} sessions expired",
                                report.purged_keys,
                                report.expired.len()
                            );
                        }
                    }
                    Err(e) => {
                        error!("Expiry sweep failed: {}", e);
                    }
                }
            }
        });

        let mut slot = self.sweep.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }

        info!(
            "Expiry sweep started with interval: {} seconds",
            interval_duration.as_secs()
        );
        Ok(())
    }

    pub fn stop_expiry_sweep(&self) {
        let mut slot = self.sweep.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            info!("Expiry sweep stopped");
        }
    }

    /// Run one sweep immediately
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweeper().sweep_once().await
    }

    fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper {
            store: self.store.clone(),
            tracked: self.tracked.clone(),
            locks: self.locks.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            warning_window_seconds: self.config.warning_window_seconds,
            tombstone_seconds: self.config.tombstone_seconds,
        }
    }

    /// Sizes of the tracking and lock maps
    #[cfg(test)]
    pub(crate) fn bookkeeping_len(&self) -> (usize, usize) {
        (self.tracked.len(), self.locks.len())
    }

    async fn lock(&self, session_id: SessionId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn resolve_ttl(&self, requested: Option<u64>) -> Result<u64> {
        let ttl = requested.unwrap_or(self.config.default_ttl_seconds);
        if ttl == 0 {
            return Err(ValidationError::parameter("ttl_seconds", "must be positive").into());
        }
        Ok(ttl.min(self.config.max_ttl_seconds))
    }

    fn track(&self, session_id: SessionId, now: DateTime<Utc>) {
        self.tracked.insert(session_id, TrackedSession::active(now));
    }

    fn mark_gone(&self, session_id: SessionId, state: SessionState) {
        if let Some(mut entry) = self.tracked.get_mut(&session_id) {
            entry.mark_gone(state, self.clock.now());
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn gone_status(&self, session_id: SessionId) -> Result<SessionStatus> {
        let Some(mut entry) = self.tracked.get_mut(&session_id) else {
            return Err(EngineError::NotFound(format!("session {}", session_id)));
        };
        let state = entry.mark_gone(SessionState::Expired, self.clock.now());
        Ok(SessionStatus {
            state,
            ..SessionStatus::expired(session_id, Some(entry.last_activity_at))
        })
    }

    /// Reserve the (owner, dataset) slot, returning the index version to assert
    async fn claim_owner_slot(
        &self,
        owner_id: &OwnerId,
        dataset_ref: &DatasetRef,
        force: bool,
    ) -> Result<Option<u64>> {
        let owner_key = env::owner_dataset_key(owner_id.as_str(), dataset_ref.as_str());
        let Some(index) = self.store.get_json::<SessionId>(&owner_key).await? else {
            return Ok(None);
        };

        let existing: Option<Versioned<Session>> = self
            .store
            .get_json(&env::session_meta_key(&index.value.to_string()))
            .await?;
        let blocking = existing.as_ref().is_some_and(|s| {
            s.value
                .effective_state(self.clock.now(), self.config.warning_window_seconds)
                .accepts_mutations()
        });
        if !blocking {
            return Ok(Some(index.version));
        }

        if !force {
            return Err(EngineError::Conflict(format!(
                "owner {} already has active session {} on dataset {}",
                owner_id, index.value, dataset_ref
            )));
        }

        info!("Closing session {} to make room for a forced initialize", index.value);
        {
            let _guard = self.lock(index.value).await;
            self.stop_locked(index.value).await?;
        }
        let index: Option<Versioned<SessionId>> = self.store.get_json(&owner_key).await?;
        Ok(index.map(|i| i.version))
    }

    fn stage_new_session(&self, session: &Session, owner_index: Option<u64>) -> Result<WriteBatch> {
        let id = session.id.to_string();
        let owner_key =
            env::owner_dataset_key(session.owner_id.as_str(), session.dataset_ref.as_str());
        Ok(WriteBatch::new(Some(Duration::from_secs(session.ttl_seconds)))
            .expect_version(env::session_meta_key(&id), None)
            .expect_version(owner_key.clone(), owner_index)
            .put(env::session_meta_key(&id), to_json_bytes(session)?)
            .put(owner_key, to_json_bytes(&session.id)?))
    }

    /// Load metadata and history of a session that accepts mutations
    async fn load_active(&self, session_id: SessionId) -> Result<Loaded> {
        let id = session_id.to_string();
        let meta = self.store.get_json::<Session>(&env::session_meta_key(&id)).await?;
        let Some(session) = meta else {
            self.mark_gone(session_id, SessionState::Expired);
            return Err(EngineError::NotFound(format!("session {}", session_id)));
        };

        match session
            .value
            .effective_state(self.clock.now(), self.config.warning_window_seconds)
        {
            SessionState::Active | SessionState::Expiring => {}
            SessionState::Closed => {
                return Err(EngineError::Conflict(format!("session {} is closed", session_id)));
            }
            SessionState::Unrecoverable => {
                return Err(EngineError::Unrecoverable {
                    session_id: id,
                    issues: session.value.unrecoverable_reason.into_iter().collect(),
                });
            }
            SessionState::Expired | SessionState::Uninitialized => {
                return Err(EngineError::NotFound(format!("session {}", session_id)));
            }
        }

        let history = self.history.load(session_id).await?.ok_or_else(|| {
            EngineError::Corrupted(format!("session {} has no history record", session_id))
        })?;

        let owner_key = env::owner_dataset_key(
            session.value.owner_id.as_str(),
            session.value.dataset_ref.as_str(),
        );
        let owner_index = self
            .store
            .get_json::<SessionId>(&owner_key)
            .await?
            .filter(|index| index.value == session_id)
            .map(|index| index.version);

        Ok(Loaded {
            session,
            history,
            owner_index,
        })
    }

    async fn load_readable(&self, session_id: SessionId) -> Result<(Session, History)> {
        let id = session_id.to_string();
        let meta = self.store.get_json::<Session>(&env::session_meta_key(&id)).await?;
        let Some(session) = meta else {
            return Err(EngineError::NotFound(format!("session {}", session_id)));
        };
        if session.value.state == SessionState::Unrecoverable {
            return Err(EngineError::Unrecoverable {
                session_id: id,
                issues: session.value.unrecoverable_reason.into_iter().collect(),
            });
        }
        let history = self.history.require(session_id).await?;
        Ok((session.value, history.value))
    }

    /// Start a batch that records activity at `now` and guards the loaded versions
    fn stage_activity(&self, loaded: &Loaded, now: DateTime<Utc>) -> Result<(Session, WriteBatch)> {
        let mut session = loaded.session.value.clone();
        session.touch(now);
        if session.state == SessionState::Expiring {
            session.state = SessionState::Active;
        }

        let meta_key = env::session_meta_key(&session.id.to_string());
        let mut batch = WriteBatch::new(Some(Duration::from_secs(session.ttl_seconds)))
            .expect_version(meta_key.clone(), Some(loaded.session.version))
            .put(meta_key, to_json_bytes(&session)?);

        if let Some(version) = loaded.owner_index {
            let owner_key =
                env::owner_dataset_key(session.owner_id.as_str(), session.dataset_ref.as_str());
            batch = batch.expect_version(owner_key.clone(), Some(version)).touch(owner_key);
        }
        Ok((session, batch))
    }

    /// Verify the cursor target exists, then commit
    async fn commit_cursor(
        &self,
        session_id: SessionId,
        batch: WriteBatch,
        history: &History,
    ) -> Result<()> {
        self.history.current_snapshot(session_id, history).await?;
        let batch = self.history.stage_touch(batch, session_id, history);
        self.store.commit(batch).await?;
        Ok(())
    }

    async fn stop_locked(&self, session_id: SessionId) -> Result<()> {
        let id = session_id.to_string();
        let meta = self.store.get_json::<Session>(&env::session_meta_key(&id)).await?;
        let Some(current) = meta else {
            return Err(EngineError::NotFound(format!("session {}", session_id)));
        };
        if current.value.state == SessionState::Closed {
            debug!("Session {} is already closed", session_id);
            return Ok(());
        }

        let now = self.clock.now();
        let mut session = current.value.clone();
        session.state = SessionState::Closed;
        session.touch(now);

        let meta_key = env::session_meta_key(&id);
        let owner_key =
            env::owner_dataset_key(session.owner_id.as_str(), session.dataset_ref.as_str());
        let index = self.store.get_json::<SessionId>(&owner_key).await?;
        let keys = self.store.keys_with_prefix(&env::session_key_prefix(&id)).await?;

        let grace = self.config.closed_grace_seconds;
        let mut batch = WriteBatch::new(Some(Duration::from_secs(grace.max(1))))
            .expect_version(meta_key.clone(), Some(current.version));
        if let Some(index) = index.filter(|i| i.value == session_id) {
            batch = batch
                .expect_version(owner_key.clone(), Some(index.version))
                .delete(owner_key);
        }

        if grace == 0 {
            for key in keys {
                batch = batch.delete(key);
            }
        } else {
            for key in keys.into_iter().filter(|k| *k != meta_key) {
                batch = batch.touch(key);
            }
            batch = batch.put(meta_key, to_json_bytes(&session)?);
        }
        self.store.commit(batch).await?;

        self.tracked.insert(
            session_id,
            TrackedSession {
                last_activity_at: now,
                warned: false,
                gone: (grace == 0).then_some((SessionState::Closed, now)),
            },
        );
        self.emit(SessionEvent::Closed { session_id });
        info!(
            "Session {} closed ({})",
            session_id,
            if grace == 0 {
                "entries released".to_string()
            } else {
                format!("recoverable for {}s", grace)
            }
        );
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweep.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

/// Periodic expiry inspection.
///
/// The sweep only reads session metadata and asks the store to drop entries
/// whose TTL has elapsed; it never writes snapshots or history, so it does
/// not take session locks.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: StoreClient,
    tracked: Arc<DashMap<SessionId, TrackedSession>>,
    locks: Arc<DashMap<SessionId, Arc<Mutex<()>>>>,
    events: broadcast::Sender<SessionEvent>,
    clock: Arc<dyn Clock>,
    warning_window_seconds: u64,
    tombstone_seconds: u64,
}

impl ExpirySweeper {
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            purged_keys: self.store.purge_expired().await?,
            ..Default::default()
        };
        let now = self.clock.now();

        // pick up sessions created by other managers sharing the store
        let prefix = format!("{}:", env::keys::SESSION_PREFIX);
        let meta_suffix = format!(":{}", env::keys::META_SUFFIX);
        for key in self.store.keys_with_prefix(&prefix).await? {
            let Some(id) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&meta_suffix))
                .and_then(|id| id.parse::<SessionId>().ok())
            else {
                continue;
            };
            self.tracked
                .entry(id)
                .or_insert_with(|| TrackedSession::active(now));
        }

        let candidates: Vec<SessionId> = self
            .tracked
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| *entry.key())
            .collect();

        for session_id in candidates {
            let meta: Option<Versioned<Session>> = match self
                .store
                .get_json(&env::session_meta_key(&session_id.to_string()))
                .await
            {
                Ok(meta) => meta,
                Err(EngineError::Corrupted(reason)) => {
                    warn!("Skipping session {} in sweep: {}", session_id, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(mut entry) = self.tracked.get_mut(&session_id) else {
                continue;
            };
            let Some(meta) = meta else {
                entry.mark_gone(SessionState::Expired, now);
                drop(entry);
                report.expired.push(session_id);
                info!("Session {} expired", session_id);
                let _ = self.events.send(SessionEvent::Expired { session_id });
                continue;
            };

            let session = meta.value;
            if session.last_activity_at != entry.last_activity_at {
                entry.last_activity_at = session.last_activity_at;
                entry.warned = false;
            }

            if session.effective_state(now, self.warning_window_seconds) == SessionState::Expiring
                && !entry.warned
            {
                entry.warned = true;
                drop(entry);
                report.expiring.push(session_id);
                warn!(
                    "Session {} expires at {} unless extended",
                    session_id,
                    session.expires_at()
                );
                let _ = self.events.send(SessionEvent::ExpiringSoon {
                    session_id,
                    expires_at: session.expires_at(),
                });
            }
        }

        self.forget_gone(now);
        Ok(report)
    }

    /// Drop tombstones past their window and locks nobody holds
    fn forget_gone(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(self.tombstone_seconds as i64);
        self.tracked.retain(|_, entry| match entry.gone {
            Some((_, gone_at)) => now - gone_at < window,
            None => true,
        });

        let idle: Vec<SessionId> = self
            .locks
            .iter()
            .filter(|lock| {
                !self
                    .tracked
                    .get(lock.key())
                    .is_some_and(|entry| entry.is_live())
            })
            .map(|lock| *lock.key())
            .collect();
        for session_id in idle {
            release_lock(&self.locks, session_id);
        }
    }
}

/// Remove the lock entry of `session_id` unless a caller holds or awaits it
fn release_lock(locks: &DashMap<SessionId, Arc<Mutex<()>>>, session_id: SessionId) {
    locks.remove_if(&session_id, |_, lock| Arc::strong_count(lock) == 1);
}
