use crate::session::metadata::SessionId;
use crate::table::Table;

/// Immutable table state at one point of a session's history.
///
/// Identified by `(session_id, sequence)`; sequence `0` is the verbatim copy
/// of the source dataset. There is no way to mutate a snapshot once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    session_id: SessionId,
    sequence: u64,
    table: Table,
}

impl Snapshot {
    pub fn new(session_id: SessionId, sequence: u64, table: Table) -> Self {
        Self {
            session_id,
            sequence,
            table,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn into_table(self) -> Table {
        self.table
    }
}
