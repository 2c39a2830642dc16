//! Persistence for execution snapshots.
//!
//! The engine hands snapshots back by value; these stores keep them between
//! process runs so a halted run can be resumed later.

pub mod memory;
pub mod sqlite;

use botrail_core::Result;
use botrail_engine::ExecutionSnapshot;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::InMemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

/// Listing entry for a stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub run_id: Uuid,
    pub halted_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed by run id; saving the same run again replaces the previous snapshot.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()>;

    fn load(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>>;

    /// Runs currently halted at an approval gate, most recent first.
    fn list_halted(&self) -> Result<Vec<StoredRun>>;

    /// Returns whether a snapshot was removed.
    fn delete(&self, run_id: Uuid) -> Result<bool>;
}
