use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use agentsync_protocol::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod fs;
mod memory;

pub use memory::MemoryThreadStore;

/// Persisted marker for a human-in-the-loop pause: enough to re-enter the
/// interrupted run at `node_id` with `pending_state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub run_id: String,
    pub agent: String,
    pub node_id: String,
    /// Payload shown to the user while waiting (question, proposal, ...).
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub pending_state: Value,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Last known state per agent name.
    #[serde(default)]
    pub agent_states: BTreeMap<String, Value>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Thread {
    pub fn empty(id: impl Into<String>) -> Self {
        let now = now_unix_millis();
        Self {
            id: id.into(),
            messages: Vec::new(),
            agent_states: BTreeMap::new(),
            checkpoints: Vec::new(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.agent_states.is_empty() && self.checkpoints.is_empty()
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.checkpoint_id == checkpoint_id)
    }

    fn append_message(&mut self, message: Message) -> Result<(), StoreError> {
        if self.messages.iter().any(|existing| existing.id == message.id) {
            return Err(StoreError::DuplicateMessage(message.id));
        }
        self.messages.push(message);
        self.touch();
        Ok(())
    }

    fn upsert_state(&mut self, agent: &str, state: Value) {
        self.agent_states.insert(agent.to_owned(), state);
        self.touch();
    }

    fn save_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints
            .retain(|existing| existing.checkpoint_id != checkpoint.checkpoint_id);
        self.checkpoints.push(checkpoint);
        self.touch();
    }

    fn take_checkpoint(&mut self, checkpoint_id: &str) -> Result<Checkpoint, StoreError> {
        let position = self
            .checkpoints
            .iter()
            .position(|checkpoint| checkpoint.checkpoint_id == checkpoint_id)
            .ok_or_else(|| StoreError::CheckpointNotFound(checkpoint_id.to_owned()))?;
        let checkpoint = self.checkpoints.remove(position);
        self.touch();
        Ok(checkpoint)
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_unix_millis().max(self.updated_at_ms);
    }
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("message already appended: {0}")]
    DuplicateMessage(String),
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
}

/// Keyed persistence of `thread id -> {messages, agent states, checkpoints}`.
///
/// Calls are synchronous; async callers run them on a blocking worker.
/// Writes to one thread are serialized; distinct threads do not contend.
pub trait ThreadStore: Send + Sync + 'static {
    /// Full thread, or an empty thread for an unknown id.
    fn get(&self, thread_id: &str) -> Result<Thread, StoreError>;
    /// Append one finalized message. Message ids are unique per thread.
    fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError>;
    fn upsert_state(&self, thread_id: &str, agent: &str, state: Value) -> Result<(), StoreError>;
    /// Returns whether the thread existed.
    fn delete(&self, thread_id: &str) -> Result<bool, StoreError>;
    /// Insert or replace a checkpoint by id.
    fn save_checkpoint(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError>;
    /// Remove and return a checkpoint.
    fn take_checkpoint(&self, thread_id: &str, checkpoint_id: &str)
        -> Result<Checkpoint, StoreError>;
    fn list_thread_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Durable backend: one directory per thread under `root`.
#[derive(Clone, Debug)]
pub struct FsThreadStore {
    root: PathBuf,
}

pub(crate) fn now_unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(_) => 0,
    }
}
