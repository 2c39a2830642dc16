use std::path::Path;
use std::sync::Mutex;

use botrail_core::{EngineError, Result};
use botrail_engine::ExecutionSnapshot;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::{SnapshotStore, StoredRun};

/// Persistent snapshot store backed by SQLite.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Store(format!("Failed to create snapshot directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngineError::Store(format!("Failed to open snapshot store: {}", e)))?;
        Self::init(conn)
    }

    /// Database that lives only as long as the store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Store(format!("Failed to open snapshot store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS snapshots (
                 run_id TEXT PRIMARY KEY,
                 halted_at TEXT,
                 terminal INTEGER NOT NULL DEFAULT 0,
                 snapshot_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snapshots_halted
                 ON snapshots(halted_at, updated_at DESC);",
        )
        .map_err(|e| EngineError::Store(format!("Failed to initialize snapshot schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Store(e.to_string()))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snapshots (run_id, halted_at, terminal, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id) DO UPDATE SET
                 halted_at = excluded.halted_at,
                 terminal = excluded.terminal,
                 snapshot_json = excluded.snapshot_json,
                 updated_at = excluded.updated_at",
            params![
                snapshot.run_id.to_string(),
                snapshot.halted_at_step,
                snapshot.terminal.is_some(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| EngineError::Store(format!("Failed to save snapshot: {}", e)))?;

        debug!(run_id = %snapshot.run_id, halted_at = ?snapshot.halted_at_step, "Saved snapshot");
        Ok(())
    }

    fn load(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EngineError::Store(format!("Failed to load snapshot: {}", e)))?;

        json.map(|j| ExecutionSnapshot::from_json(&j)).transpose()
    }

    fn list_halted(&self) -> Result<Vec<StoredRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, halted_at, updated_at
                 FROM snapshots
                 WHERE halted_at IS NOT NULL
                 ORDER BY updated_at DESC",
            )
            .map_err(|e| EngineError::Store(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let run_id: String = row.get(0)?;
                let halted_at: Option<String> = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok((run_id, halted_at, updated_at))
            })
            .map_err(|e| EngineError::Store(format!("Failed to list snapshots: {}", e)))?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, halted_at, updated_at) =
                row.map_err(|e| EngineError::Store(e.to_string()))?;
            let run_id = Uuid::parse_str(&run_id)
                .map_err(|e| EngineError::Store(format!("Corrupt run id {}: {}", run_id, e)))?;
            runs.push(StoredRun {
                run_id,
                halted_at,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(runs)
    }

    fn delete(&self, run_id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM snapshots WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .map_err(|e| EngineError::Store(format!("Failed to delete snapshot: {}", e)))?;
        Ok(deleted > 0)
    }
}
