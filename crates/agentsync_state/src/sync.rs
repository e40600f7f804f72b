use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use agentsync_protocol::PatchOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::PatchError;
use crate::merge::merged;
use crate::patch::apply_patch;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub thread_id: String,
    pub agent: String,
}

impl StateKey {
    pub fn new(thread_id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            agent: agent.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOrigin {
    Agent,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    Seed,
    Snapshot,
    Delta,
    Merge,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VersionedState {
    pub version: u64,
    pub value: Arc<Value>,
    pub last_origin: Option<WriteOrigin>,
}

/// One committed write, published to `watch` subscribers in commit order.
#[derive(Clone, Debug, PartialEq)]
pub struct StateUpdate {
    pub key: StateKey,
    pub version: u64,
    pub origin: WriteOrigin,
    pub kind: WriteKind,
    pub state: Arc<Value>,
}

#[derive(Debug, Default)]
struct StateCell {
    version: u64,
    value: Arc<Value>,
    last_origin: Option<WriteOrigin>,
}

/// Authoritative state per (thread, agent) pair.
///
/// Agent events and local UI writes go through the same per-cell lock, so
/// they are applied strictly in receipt order: a later agent snapshot or
/// delta overwrites an earlier local merge. Distinct keys never contend
/// beyond the short index lookup.
#[derive(Debug)]
pub struct StateSynchronizer {
    cells: RwLock<HashMap<StateKey, Arc<Mutex<StateCell>>>>,
    updates: broadcast::Sender<StateUpdate>,
}

impl Default for StateSynchronizer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StateSynchronizer {
    /// `update_capacity` bounds the `watch` broadcast ring; slow watchers lag.
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            cells: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn watch(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Current value, `null` for a key never written.
    pub fn snapshot(&self, key: &StateKey) -> Arc<Value> {
        self.versioned(key).value
    }

    pub fn versioned(&self, key: &StateKey) -> VersionedState {
        match self.existing(key) {
            Some(cell) => {
                let guard = lock_cell(&cell);
                VersionedState {
                    version: guard.version,
                    value: Arc::clone(&guard.value),
                    last_origin: guard.last_origin,
                }
            }
            None => VersionedState {
                version: 0,
                value: Arc::new(Value::Null),
                last_origin: None,
            },
        }
    }

    /// Load a persisted value into a cell that has never been written.
    /// Returns false (and changes nothing) when the cell is already live.
    pub fn seed(&self, key: &StateKey, value: Value) -> bool {
        let cell = self.cell(key);
        let mut guard = lock_cell(&cell);
        if guard.version > 0 {
            return false;
        }
        self.commit(key, &mut guard, value, WriteOrigin::Agent, WriteKind::Seed);
        true
    }

    /// Replace the state wholesale. Always succeeds.
    pub fn apply_snapshot(&self, key: &StateKey, snapshot: Value) -> StateUpdate {
        let cell = self.cell(key);
        let mut guard = lock_cell(&cell);
        self.commit(
            key,
            &mut guard,
            snapshot,
            WriteOrigin::Agent,
            WriteKind::Snapshot,
        )
    }

    /// Apply an ordered patch atomically. On error the cell keeps its value
    /// and version.
    pub fn apply_delta(&self, key: &StateKey, ops: &[PatchOp]) -> Result<StateUpdate, PatchError> {
        let cell = self.cell(key);
        let mut guard = lock_cell(&cell);
        let next = apply_patch(&guard.value, ops).map_err(|err| {
            tracing::debug!(
                thread_id = %key.thread_id,
                agent = %key.agent,
                version = guard.version,
                error = %err,
                "state delta aborted"
            );
            err
        })?;
        Ok(self.commit(key, &mut guard, next, WriteOrigin::Agent, WriteKind::Delta))
    }

    /// Deep-merge a UI-originated partial value.
    pub fn merge_local(&self, key: &StateKey, partial: &Value) -> StateUpdate {
        let cell = self.cell(key);
        let mut guard = lock_cell(&cell);
        let next = merged(&guard.value, partial);
        self.commit(key, &mut guard, next, WriteOrigin::Local, WriteKind::Merge)
    }

    /// Drop every cell of one thread. Returns the number of cells removed.
    pub fn forget_thread(&self, thread_id: &str) -> usize {
        let mut cells = match self.cells.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = cells.len();
        cells.retain(|key, _| key.thread_id != thread_id);
        let removed = before - cells.len();
        if removed > 0 {
            tracing::debug!(thread_id, removed, "forgot thread state");
        }
        removed
    }

    fn commit(
        &self,
        key: &StateKey,
        cell: &mut StateCell,
        value: Value,
        origin: WriteOrigin,
        kind: WriteKind,
    ) -> StateUpdate {
        cell.version += 1;
        cell.value = Arc::new(value);
        cell.last_origin = Some(origin);
        let update = StateUpdate {
            key: key.clone(),
            version: cell.version,
            origin,
            kind,
            state: Arc::clone(&cell.value),
        };
        // Published under the cell lock so watchers observe commit order.
        // No watchers is fine.
        let _ = self.updates.send(update.clone());
        update
    }

    fn existing(&self, key: &StateKey) -> Option<Arc<Mutex<StateCell>>> {
        let cells = match self.cells.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.get(key).cloned()
    }

    fn cell(&self, key: &StateKey) -> Arc<Mutex<StateCell>> {
        if let Some(cell) = self.existing(key) {
            return cell;
        }
        let mut cells = match self.cells.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(cells.entry(key.clone()).or_default())
    }
}

fn lock_cell(cell: &Mutex<StateCell>) -> MutexGuard<'_, StateCell> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
