use std::collections::HashMap;
use std::sync::RwLock;

use botrail_core::{EngineError, Result};
use botrail_engine::ExecutionSnapshot;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{SnapshotStore, StoredRun};

/// Process-local store, mainly for tests and embedding.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    runs: RwLock<HashMap<Uuid, (ExecutionSnapshot, DateTime<Utc>)>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Store(e.to_string())
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        runs.insert(snapshot.run_id, (snapshot.clone(), Utc::now()));
        Ok(())
    }

    fn load(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.get(&run_id).map(|(snap, _)| snap.clone()))
    }

    fn list_halted(&self) -> Result<Vec<StoredRun>> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut halted: Vec<StoredRun> = runs
            .values()
            .filter(|(snap, _)| snap.halted_at_step.is_some())
            .map(|(snap, at)| StoredRun {
                run_id: snap.run_id,
                halted_at: snap.halted_at_step.clone(),
                updated_at: *at,
            })
            .collect();
        halted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(halted)
    }

    fn delete(&self, run_id: Uuid) -> Result<bool> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        Ok(runs.remove(&run_id).is_some())
    }
}
