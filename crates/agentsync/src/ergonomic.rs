use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentsync_protocol::{Event, Role};
use agentsync_runtime::{
    AgentAdapter, BackendTool, Orchestrator, RunRequest, RunTimeouts, RuntimeConfig, RuntimeError,
    INTERRUPT_EVENT,
};
use agentsync_store::{FsThreadStore, MemoryThreadStore, ThreadStore};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const STORE_DIR_ENV: &str = "AGENTSYNC_STORE_DIR";

/// Where a `Copilot` keeps its threads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// Process-local. `max_threads` evicts the least recently active thread.
    Memory { max_threads: Option<usize> },
    /// Durable, one directory per thread.
    Dir(PathBuf),
}

impl Default for StoreLocation {
    fn default() -> Self {
        Self::Memory { max_threads: None }
    }
}

/// Runtime settings plus store choice for one `Copilot`.
#[derive(Clone, Debug, Default)]
pub struct CopilotConfig {
    pub runtime: RuntimeConfig,
    pub store: StoreLocation,
}

impl CopilotConfig {
    /// Defaults: unbounded in-memory store, no timeouts, 16 steps per run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `AGENTSYNC_*` environment overrides applied.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// `AGENTSYNC_STORE_DIR` switches to a filesystem store; the other
    /// variables go to `RuntimeConfig::with_env_overrides`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeError> {
        self.runtime = self.runtime.with_env_overrides(&lookup)?;
        if let Some(dir) = lookup(STORE_DIR_ENV) {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.store = StoreLocation::Dir(absolutize_without_fs_checks(dir));
            }
        }
        Ok(self)
    }

    /// Replace whole runtime config.
    pub fn with_runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_timeouts(mut self, timeouts: RunTimeouts) -> Self {
        self.runtime = self.runtime.with_timeouts(timeouts);
        self
    }

    /// Bound the whole run, measured from dispatch.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.runtime.timeouts.run = Some(timeout);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.runtime = self.runtime.with_max_steps(max_steps);
        self
    }

    /// Persist threads under `dir`. Relative paths resolve against the
    /// current directory; nothing is created until the first write.
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir: PathBuf = dir.into();
        self.store = StoreLocation::Dir(absolutize_without_fs_checks(&dir.to_string_lossy()));
        self
    }

    pub fn with_memory_store(mut self, max_threads: Option<usize>) -> Self {
        self.store = StoreLocation::Memory { max_threads };
        self
    }

    pub fn open_store(&self) -> Result<Arc<dyn ThreadStore>, RuntimeError> {
        match &self.store {
            StoreLocation::Memory { max_threads: None } => Ok(Arc::new(MemoryThreadStore::new())),
            StoreLocation::Memory {
                max_threads: Some(0),
            } => Err(RuntimeError::InvalidConfig(
                "memory store max_threads must be > 0".to_owned(),
            )),
            StoreLocation::Memory {
                max_threads: Some(max),
            } => Ok(Arc::new(MemoryThreadStore::with_max_threads(*max))),
            StoreLocation::Dir(dir) => Ok(Arc::new(FsThreadStore::new(dir.clone()))),
        }
    }
}

/// Assistant text of one finished run plus every event it emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub run_id: String,
    pub text: String,
    /// `RUN_FINISHED` result, when the agent reported one.
    pub result: Option<Value>,
    pub events: Vec<Event>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AskError {
    #[error("failed to start run: {0}")]
    Dispatch(#[from] RuntimeError),
    #[error("run {run_id} failed: {message} (code={code:?})")]
    Run {
        run_id: String,
        code: Option<String>,
        message: String,
    },
    /// The run is paused and waits for `Orchestrator::resume`; its remaining
    /// events go to live subscribers and listeners.
    #[error("run {run_id} paused at `{node_id}` (checkpoint {checkpoint_id})")]
    Interrupted {
        run_id: String,
        checkpoint_id: String,
        node_id: String,
    },
    #[error("run {run_id} stream closed before a terminal event")]
    Incomplete { run_id: String },
}

/// One reusable copilot handle:
/// - simple path: `ask(thread_id, text)`
/// - expert path: `orchestrator()` for streaming, tools, and resume
#[derive(Clone)]
pub struct Copilot {
    orchestrator: Orchestrator,
    config: CopilotConfig,
}

impl Copilot {
    /// Open the store and install `adapter` as the default agent.
    /// Must be called from inside a tokio runtime.
    pub fn start(
        config: CopilotConfig,
        adapter: Arc<dyn AgentAdapter>,
    ) -> Result<Self, RuntimeError> {
        let store = config.open_store()?;
        let orchestrator = Orchestrator::new(config.runtime.clone(), store)?;
        orchestrator.set_default_adapter(adapter)?;
        Ok(Self {
            orchestrator,
            config,
        })
    }

    /// Start with defaults and an in-memory store.
    pub fn start_default(adapter: Arc<dyn AgentAdapter>) -> Result<Self, RuntimeError> {
        Self::start(CopilotConfig::new(), adapter)
    }

    pub fn with_tool(self, tool: Arc<dyn BackendTool>) -> Result<Self, RuntimeError> {
        self.orchestrator.register_tool(tool)?;
        Ok(self)
    }

    pub fn with_agent(
        self,
        name: impl Into<String>,
        adapter: Arc<dyn AgentAdapter>,
    ) -> Result<Self, RuntimeError> {
        self.orchestrator.register_agent(name, adapter)?;
        Ok(self)
    }

    /// Send one user message on `thread_id` and wait for the run to end.
    pub async fn ask(
        &self,
        thread_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Reply, AskError> {
        self.ask_with_request(RunRequest::new(thread_id).with_user_message(text))
            .await
    }

    /// Run one explicit request and wait for it to end or pause.
    pub async fn ask_with_request(&self, request: RunRequest) -> Result<Reply, AskError> {
        let mut handle = self.orchestrator.dispatch(request)?;
        let run_id = handle.run_id().to_owned();
        debug!(run_id = %run_id, thread_id = %handle.thread_id(), "copilot run dispatched");
        let events = handle
            .collect_until(|event| event.is_terminal() || interrupt_notice(event).is_some())
            .await;
        fold_reply(run_id, events)
    }

    pub fn config(&self) -> &CopilotConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// One-shot convenience:
/// in-memory copilot -> ask on a fresh thread -> assistant text
pub async fn quick_ask(
    adapter: Arc<dyn AgentAdapter>,
    text: impl Into<String>,
) -> Result<String, AskError> {
    let copilot = Copilot::start_default(adapter)?;
    let thread_id = format!("quick_{}", uuid::Uuid::new_v4().simple());
    copilot.ask(thread_id, text).await.map(|reply| reply.text)
}

fn fold_reply(run_id: String, events: Vec<Event>) -> Result<Reply, AskError> {
    let mut assistant_messages = HashSet::new();
    let mut text = String::new();
    let mut result = None;
    for event in &events {
        match event {
            Event::TextMessageStart { message_id, role } if *role == Role::Assistant => {
                assistant_messages.insert(message_id.clone());
            }
            Event::TextMessageContent { message_id, delta }
                if assistant_messages.contains(message_id) =>
            {
                text.push_str(delta);
            }
            Event::RunFinished { result: done, .. } => result = done.clone(),
            _ => {}
        }
    }

    match events.last() {
        Some(Event::RunFinished { .. }) => Ok(Reply {
            run_id,
            text,
            result,
            events,
        }),
        Some(Event::RunError { message, code }) => Err(AskError::Run {
            run_id,
            code: code.clone(),
            message: message.clone(),
        }),
        Some(event) => match interrupt_notice(event) {
            Some((checkpoint_id, node_id)) => Err(AskError::Interrupted {
                run_id,
                checkpoint_id,
                node_id,
            }),
            None => Err(AskError::Incomplete { run_id }),
        },
        None => Err(AskError::Incomplete { run_id }),
    }
}

fn interrupt_notice(event: &Event) -> Option<(String, String)> {
    let Event::Custom { name, value } = event else {
        return None;
    };
    if name != INTERRUPT_EVENT {
        return None;
    }
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
    Some((field("checkpointId")?, field("nodeId")?))
}

fn absolutize_without_fs_checks(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(current) => current.join(path),
        Err(_) => path,
    }
}

#[cfg(test)]
mod tests;
