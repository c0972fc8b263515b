use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique session identifier
pub type SessionId = uuid::Uuid;

/// Immutable reference to a source dataset owned by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetRef(pub String);

impl DatasetRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the user owning a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a session.
///
/// Only `Active`, `Closed` and `Unrecoverable` are ever persisted. `Expiring`
/// is derived from idle time and `Expired` from the store having dropped the
/// session's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Active,
    Expiring,
    Expired,
    Closed,
    Unrecoverable,
}

impl SessionState {
    /// Whether mutating calls are accepted in this state
    pub fn accepts_mutations(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Expiring)
    }
}

/// Format version of persisted session records for compatibility tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionVersion {
    pub major: u32,
    pub minor: u32,
    pub engine_version: String,
}

impl SessionVersion {
    /// Get current session version
    pub fn current() -> Self {
        Self {
            major: 1,
            minor: 0,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Check compatibility with another version
    pub fn is_compatible_with(&self, other: &SessionVersion) -> bool {
        self.major == other.major
    }
}

/// Persisted session record (`session:{id}:meta`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub dataset_ref: DatasetRef,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub state: SessionState,
    pub version: SessionVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrecoverable_reason: Option<String>,
}

impl Session {
    /// Create new session metadata
    pub fn new(
        dataset_ref: DatasetRef,
        owner_id: OwnerId,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new_v4(),
            dataset_ref,
            owner_id,
            created_at: now,
            last_activity_at: now,
            ttl_seconds,
            state: SessionState::Uninitialized,
            version: SessionVersion::current(),
            unrecoverable_reason: None,
        }
    }

    /// Record activity at `now`
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_activity_at + Duration::seconds(self.ttl_seconds as i64)
    }

    /// State as observed at `now`, deriving `Expiring` from idle time
    pub fn effective_state(&self, now: DateTime<Utc>, warning_window_seconds: u64) -> SessionState {
        match self.state {
            SessionState::Active => {
                let warn_after = self.ttl_seconds.saturating_sub(warning_window_seconds);
                let idle = now.signed_duration_since(self.last_activity_at);
                if idle >= Duration::seconds(self.ttl_seconds as i64) {
                    SessionState::Expired
                } else if idle >= Duration::seconds(warn_after as i64) {
                    SessionState::Expiring
                } else {
                    SessionState::Active
                }
            }
            other => other,
        }
    }

    /// Check if the record is compatible with the current version
    pub fn is_compatible(&self) -> bool {
        self.version.is_compatible_with(&SessionVersion::current())
    }
}

/// Read-only view returned by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub exists: bool,
    pub state: SessionState,
    pub operations_count: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    /// Status of a session whose store entries are gone
    pub fn expired(session_id: SessionId, last_activity_at: Option<DateTime<Utc>>) -> Self {
        Self {
            session_id,
            exists: false,
            state: SessionState::Expired,
            operations_count: 0,
            can_undo: false,
            can_redo: false,
            last_activity_at,
            expires_at: None,
        }
    }
}

/// Events published by the session manager and its expiry sweep
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Initialized {
        session_id: SessionId,
    },
    ExpiringSoon {
        session_id: SessionId,
        expires_at: DateTime<Utc>,
    },
    Expired {
        session_id: SessionId,
    },
    Closed {
        session_id: SessionId,
    },
    Unrecoverable {
        session_id: SessionId,
        reason: String,
    },
}
