//! # Wrangle
//!
//! A session-scoped transformation engine for tabular datasets. A session
//! binds one owner to one dataset, applies typed operations to it, and keeps
//! an immutable snapshot after every step so any point in the history can be
//! restored with undo and redo.
//!
//! ## Architecture Overview
//!
//! - **[`table`]**: Columnar in-memory tables with typed, nullable columns
//! - **[`engine`]**: Operation definitions, validation and pure transformations
//! - **[`history`]**: Cursor-based operation log over immutable snapshots
//! - **[`codec`]**: Versioned, checksummed binary frames for snapshots
//! - **[`session`]**: Lifecycle, expiry, persistence, recovery and export/import
//! - **[`catalog`]**: Source datasets and saved results
//!
//! Every mutation commits its snapshot, history and metadata in one atomic
//! store batch guarded by version assertions, so concurrent writers to the
//! same session either win cleanly or receive [`EngineError::Conflict`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wrangle::{
//!     ApplyRequest, InMemoryCatalog, InitRequest, MemoryStore, Operation, SessionManager,
//!     SessionManagerConfig, SystemClock, Table,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let clock = Arc::new(SystemClock);
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     let records = vec![serde_json::json!({"age": 30})];
//!     catalog.insert("people", Table::from_records(&records)?);
//!
//!     let store = Arc::new(MemoryStore::new(clock.clone()));
//!     let manager = SessionManager::new(SessionManagerConfig::default(), store, catalog, clock);
//!
//!     let session = manager.initialize(InitRequest::new("people", "analyst")).await?;
//!     let rename = Operation::RenameColumn { from: "age".into(), to: "years".into() };
//!     manager.apply(session.id, ApplyRequest::from(rename)).await?;
//!     manager.undo(session.id).await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod clock;
pub mod codec;

/// Operation definitions and the transformation engine.
pub mod engine;

/// Environment constants, store key layout and path utilities.
pub mod env;

pub mod error;

/// Operation history and snapshot storage.
pub mod history;

/// Session lifecycle management, persistence and recovery.
pub mod session;

pub mod table;

// CLI module for command-line interface
pub mod cli;

pub use catalog::{DatasetCatalog, InMemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecConfig, CodecError, SnapshotCodec};
pub use engine::{EngineConfig, Operation, OperationEngine, OperationType};
pub use error::{EngineError, Result, ValidationError};
pub use history::{History, OperationRecord, Snapshot};
pub use session::{
    ApplyRequest, DatasetRef, ExportMode, ImportOptions, InitRequest, MemoryStore, MutationOutcome,
    OwnerId, SaveMode, Session, SessionDocument, SessionEvent, SessionId, SessionManager,
    SessionManagerConfig, SessionState, SessionStatus, SessionStore,
};
pub use table::{Cell, Column, ColumnData, ColumnType, Table};
