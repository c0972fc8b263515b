use crate::clock::Clock;
use crate::env;
use crate::error::{EngineError, Result};
use crate::history::{History, HistoryController};
use crate::session::metadata::*;
use crate::session::persistence::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Rebuilds a session from the store after a restart or reconnect, checking
/// every snapshot the history refers to.
#[derive(Clone)]
pub struct RecoveryService {
    store: StoreClient,
    history: HistoryController,
    clock: Arc<dyn Clock>,
}

/// Outcome of a successful recovery
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub recovery_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub session: Versioned<Session>,
    pub history: Versioned<History>,
    pub verified_snapshots: usize,
}

impl RecoveryService {
    pub fn new(store: StoreClient, history: HistoryController, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            history,
            clock,
        }
    }

    /// Verify a persisted session end to end.
    ///
    /// Missing metadata is `NotFound`. Anything else that is missing or does
    /// not match its checksum marks the session unrecoverable; the history is
    /// left exactly as found.
    pub async fn recover(&self, session_id: SessionId) -> Result<RecoveryReport> {
        let started_at = self.clock.now();
        let recovery_id = uuid::Uuid::new_v4().to_string();
        info!("Starting recovery {} for session {}", recovery_id, session_id);

        let meta_key = env::session_meta_key(&session_id.to_string());
        let session: Versioned<Session> = match self.store.get_json(&meta_key).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return Err(EngineError::NotFound(format!("session {}", session_id)));
            }
            Err(EngineError::Corrupted(reason)) => {
                error!("Session {} metadata is unreadable: {}", session_id, reason);
                return Err(EngineError::Unrecoverable {
                    session_id: session_id.to_string(),
                    issues: vec![reason],
                });
            }
            Err(e) => return Err(e),
        };

        if session.value.state == SessionState::Unrecoverable {
            return Err(EngineError::Unrecoverable {
                session_id: session_id.to_string(),
                issues: vec![session
                    .value
                    .unrecoverable_reason
                    .clone()
                    .unwrap_or_else(|| "previously marked unrecoverable".to_string())],
            });
        }

        let (history, issues) = self.inspect(session_id, &session.value).await?;
        match history {
            Some(history) if issues.is_empty() => {
                let verified_snapshots = history.value.referenced_sequences().len();
                info!(
                    "Recovered session {} ({} snapshots verified)",
                    session_id, verified_snapshots
                );
                Ok(RecoveryReport {
                    recovery_id,
                    started_at,
                    completed_at: self.clock.now(),
                    session,
                    history,
                    verified_snapshots,
                })
            }
            _ => {
                self.mark_unrecoverable(&session, &issues).await;
                Err(EngineError::Unrecoverable {
                    session_id: session_id.to_string(),
                    issues,
                })
            }
        }
    }

    /// Collect integrity issues without changing anything
    pub async fn inspect(
        &self,
        session_id: SessionId,
        session: &Session,
    ) -> Result<(Option<Versioned<History>>, Vec<String>)> {
        let mut issues = Vec::new();

        if !session.is_compatible() {
            issues.push(format!(
                "session format {}.{} is not compatible with this engine",
                session.version.major, session.version.minor
            ));
        }

        let history = match self.history.load(session_id).await {
            Ok(Some(history)) => history,
            Ok(None) => {
                issues.push("history record is missing".to_string());
                return Ok((None, issues));
            }
            Err(EngineError::Corrupted(reason)) => {
                issues.push(reason);
                return Ok((None, issues));
            }
            Err(e) => return Err(e),
        };

        issues.extend(history.value.integrity_issues());

        for sequence in history.value.referenced_sequences() {
            let checksum = history.value.checksum_for(sequence);
            match self.history.fetch_verified(session_id, sequence, checksum).await {
                Ok(_) => {}
                Err(EngineError::Corrupted(reason)) => issues.push(reason),
                Err(EngineError::Codec(e)) => {
                    issues.push(format!("snapshot {} cannot be decoded: {}", sequence, e))
                }
                Err(e) => return Err(e),
            }
        }

        Ok((Some(history), issues))
    }

    async fn mark_unrecoverable(&self, session: &Versioned<Session>, issues: &[String]) {
        let id = session.value.id;
        warn!("Session {} is unrecoverable: {}", id, issues.join("; "));

        let mut updated = session.value.clone();
        updated.state = SessionState::Unrecoverable;
        updated.unrecoverable_reason = Some(issues.join("; "));

        let bytes = match to_json_bytes(&updated) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize unrecoverable marker for {}: {}", id, e);
                return;
            }
        };
        let ttl = Some(Duration::from_secs(updated.ttl_seconds));
        if let Err(e) = self
            .store
            .compare_and_swap(
                &env::session_meta_key(&id.to_string()),
                Some(session.version),
                bytes,
                ttl,
            )
            .await
        {
            warn!("Could not mark session {} unrecoverable: {}", id, e);
        }
    }
}
