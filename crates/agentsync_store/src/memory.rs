use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use agentsync_protocol::Message;
use serde_json::Value;

use super::{Checkpoint, StoreError, Thread, ThreadStore};

#[derive(Debug)]
struct Entry {
    thread: Arc<Mutex<Thread>>,
    last_active: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, Entry>,
    clock: u64,
}

/// Volatile backend. The index lock is held only for lookup; each thread
/// has its own mutex, so writes to different threads never wait on each
/// other. With `max_threads` set, admitting a new thread evicts the least
/// recently active one.
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    index: Mutex<Index>,
    max_threads: Option<usize>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_threads(max_threads: usize) -> Self {
        Self {
            index: Mutex::new(Index::default()),
            max_threads: Some(max_threads.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.index).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle of a thread already held. Marks it active.
    fn existing(&self, thread_id: &str) -> Option<Arc<Mutex<Thread>>> {
        let mut index = lock(&self.index);
        index.clock += 1;
        let now = index.clock;
        let entry = index.entries.get_mut(thread_id)?;
        entry.last_active = now;
        Some(Arc::clone(&entry.thread))
    }

    /// Handle for `thread_id`, created on first write. Only admission
    /// evicts, so reads never cost another thread its history.
    /// Complexity: O(1), or O(n) when an eviction scan runs.
    fn admit(&self, thread_id: &str) -> Arc<Mutex<Thread>> {
        let mut index = lock(&self.index);
        index.clock += 1;
        let now = index.clock;
        if let Some(entry) = index.entries.get_mut(thread_id) {
            entry.last_active = now;
            return Arc::clone(&entry.thread);
        }

        if let Some(max) = self.max_threads {
            while index.entries.len() >= max {
                let Some(victim) = index
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_active)
                    .map(|(id, _)| id.clone())
                else {
                    break;
                };
                index.entries.remove(&victim);
                tracing::debug!(thread_id = %victim, "evicted least recently active thread");
            }
        }

        let thread = Arc::new(Mutex::new(Thread::empty(thread_id)));
        index.entries.insert(
            thread_id.to_owned(),
            Entry {
                thread: Arc::clone(&thread),
                last_active: now,
            },
        );
        thread
    }

    fn with_thread<T>(&self, thread_id: &str, f: impl FnOnce(&mut Thread) -> T) -> T {
        let handle = self.admit(thread_id);
        let mut thread = lock(&handle);
        f(&mut thread)
    }
}

impl ThreadStore for MemoryThreadStore {
    fn get(&self, thread_id: &str) -> Result<Thread, StoreError> {
        Ok(match self.existing(thread_id) {
            Some(handle) => lock(&handle).clone(),
            None => Thread::empty(thread_id),
        })
    }

    fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError> {
        self.with_thread(thread_id, |thread| thread.append_message(message))
    }

    fn upsert_state(&self, thread_id: &str, agent: &str, state: Value) -> Result<(), StoreError> {
        self.with_thread(thread_id, |thread| thread.upsert_state(agent, state));
        Ok(())
    }

    fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.index).entries.remove(thread_id).is_some())
    }

    fn save_checkpoint(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.with_thread(thread_id, |thread| thread.save_checkpoint(checkpoint));
        Ok(())
    }

    fn take_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, StoreError> {
        match self.existing(thread_id) {
            Some(handle) => lock(&handle).take_checkpoint(checkpoint_id),
            None => Err(StoreError::CheckpointNotFound(checkpoint_id.to_owned())),
        }
    }

    fn list_thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = lock(&self.index).entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests;
