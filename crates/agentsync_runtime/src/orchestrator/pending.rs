use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use super::ToolOutcome;
use crate::errors::RuntimeError;
use crate::metrics::RuntimeMetrics;

#[derive(Debug)]
struct PendingToolCall {
    run_id: String,
    tx: oneshot::Sender<ToolOutcome>,
}

#[derive(Debug)]
struct PendingResume {
    run_id: String,
    tx: oneshot::Sender<Value>,
}

/// Waiters for the two externally resolved suspension points: frontend
/// tool results keyed by tool call id, and resume payloads keyed by
/// (thread id, checkpoint id). Entries are removed on completion or when
/// their run terminates.
#[derive(Debug)]
pub(crate) struct PendingRegistry {
    tool_calls: Mutex<HashMap<String, PendingToolCall>>,
    resumes: Mutex<HashMap<(String, String), PendingResume>>,
    metrics: Arc<RuntimeMetrics>,
}

impl PendingRegistry {
    pub(crate) fn new(metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            tool_calls: Mutex::new(HashMap::new()),
            resumes: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns `None` when the id is already awaited by some run.
    pub(crate) fn register_tool_call(
        &self,
        run_id: &str,
        tool_call_id: &str,
    ) -> Option<oneshot::Receiver<ToolOutcome>> {
        let mut tool_calls = lock(&self.tool_calls);
        if tool_calls.contains_key(tool_call_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        tool_calls.insert(
            tool_call_id.to_owned(),
            PendingToolCall {
                run_id: run_id.to_owned(),
                tx,
            },
        );
        self.metrics.inc_pending_tool_call();
        Some(rx)
    }

    /// Deliver a frontend tool result. A result is accepted once.
    pub(crate) fn complete_tool_call(
        &self,
        tool_call_id: &str,
        outcome: ToolOutcome,
    ) -> Result<String, RuntimeError> {
        let pending = lock(&self.tool_calls)
            .remove(tool_call_id)
            .ok_or_else(|| RuntimeError::ToolCallNotPending(tool_call_id.to_owned()))?;
        self.metrics.dec_pending_tool_call();
        pending
            .tx
            .send(outcome)
            .map_err(|_| RuntimeError::ToolCallNotPending(tool_call_id.to_owned()))?;
        Ok(pending.run_id)
    }

    pub(crate) fn register_resume(
        &self,
        run_id: &str,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let previous = lock(&self.resumes).insert(
            (thread_id.to_owned(), checkpoint_id.to_owned()),
            PendingResume {
                run_id: run_id.to_owned(),
                tx,
            },
        );
        if previous.is_none() {
            self.metrics.inc_pending_resume();
        }
        rx
    }

    /// Hand `payload` to a live interrupted run. Returns the run id, or
    /// `None` when no live run waits on this checkpoint.
    pub(crate) fn complete_resume(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        payload: Value,
    ) -> Option<String> {
        let key = (thread_id.to_owned(), checkpoint_id.to_owned());
        let pending = lock(&self.resumes).remove(&key)?;
        self.metrics.dec_pending_resume();
        pending.tx.send(payload).ok()?;
        Some(pending.run_id)
    }

    /// Drop every waiter owned by `run_id`.
    /// Complexity: O(t + r), t/r = pending tool calls/resumes.
    pub(crate) fn release_run(&self, run_id: &str) {
        let released_tools = {
            let mut tool_calls = lock(&self.tool_calls);
            let before = tool_calls.len();
            tool_calls.retain(|_, pending| pending.run_id != run_id);
            before - tool_calls.len()
        };
        let released_resumes = {
            let mut resumes = lock(&self.resumes);
            let before = resumes.len();
            resumes.retain(|_, pending| pending.run_id != run_id);
            before - resumes.len()
        };
        for _ in 0..released_tools {
            self.metrics.dec_pending_tool_call();
        }
        for _ in 0..released_resumes {
            self.metrics.dec_pending_resume();
        }
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize) {
        (lock(&self.tool_calls).len(), lock(&self.resumes).len())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
