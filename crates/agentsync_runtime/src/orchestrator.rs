use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use agentsync_protocol::{ContextItem, Event, Message, PatchOp, ProtocolVersion, ToolDefinition};
use agentsync_state::{PatchError, StateKey, StateSynchronizer, StateUpdate};
use agentsync_store::{Checkpoint, StoreError, Thread, ThreadStore};
use arc_swap::ArcSwap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AgentAdapter;
use crate::config::RuntimeConfig;
use crate::errors::RuntimeError;
use crate::events::RunEnvelope;
use crate::metrics::{RuntimeMetrics, RuntimeMetricsSnapshot};
use crate::sink::EventListener;
use crate::tools::{BackendTool, ToolRegistry};

mod assembler;
mod pending;
mod publish;
mod run_loop;

use pending::PendingRegistry;
use publish::ListenerList;
pub use run_loop::{STATE_DELTA_REJECTED_EVENT, TOOL_RESULT_EVENT};
use run_loop::{RunStart, RunTask};

/// Terminal runs kept for `run_status` lookups before the oldest is dropped.
const RETAINED_TERMINAL_RUNS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    Interrupted,
    Finished,
    Errored,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored)
    }
}

/// Result supplied for a frontend tool call.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

/// One dispatch from the UI side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunRequest {
    pub thread_id: String,
    /// Caller-chosen run id; generated when absent.
    pub run_id: Option<String>,
    /// Registered agent to route to; the default LLM adapter when absent.
    pub agent: Option<String>,
    /// New user message, persisted before the first adapter step.
    pub message: Option<Message>,
    pub context: Vec<ContextItem>,
    /// Frontend-declared tools, resolved by the caller via `respond`.
    pub tools: Vec<ToolDefinition>,
    /// UI state deep-merged into the agent state before the run starts.
    pub state: Option<Value>,
}

impl RunRequest {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Self::default()
        }
    }

    pub fn with_user_message(self, content: impl Into<String>) -> Self {
        self.with_message(Message::user(new_message_id(), content))
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_context(mut self, item: ContextItem) -> Self {
        self.context.push(item);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// Subscriber side of one run. The stream closes after the terminal event.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    thread_id: String,
    events: mpsc::Receiver<RunEnvelope>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub async fn next(&mut self) -> Option<RunEnvelope> {
        self.events.recv().await
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.next().await.map(|envelope| envelope.event)
    }

    /// Receive events up to and including the first one matching `stop`.
    pub async fn collect_until(&mut self, stop: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = self.next_event().await {
            let done = stop(&event);
            out.push(event);
            if done {
                break;
            }
        }
        out
    }

    pub async fn collect_until_terminal(&mut self) -> Vec<Event> {
        self.collect_until(Event::is_terminal).await
    }

    /// Request cancellation. The run still emits its terminal `RUN_ERROR`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_stream(self) -> impl Stream<Item = RunEnvelope> + Send + 'static {
        futures::stream::unfold(self.events, |mut events| async move {
            events.recv().await.map(|envelope| (envelope, events))
        })
    }
}

#[derive(Debug)]
pub enum ResumeOutcome {
    /// The interrupted run was still live and continues on its own stream.
    Resumed { run_id: String },
    /// No live run held the checkpoint; a continuation run was started
    /// with the interrupted run as its parent.
    Continued(RunHandle),
}

#[derive(Clone, Default)]
pub(crate) struct Registry {
    pub(crate) default_adapter: Option<Arc<dyn AgentAdapter>>,
    pub(crate) agents: HashMap<String, Arc<dyn AgentAdapter>>,
    pub(crate) tools: ToolRegistry,
}

#[derive(Debug)]
struct RunEntry {
    thread_id: String,
    status: RunStatus,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RunTable {
    entries: HashMap<String, RunEntry>,
    terminal: VecDeque<String>,
}

pub(crate) struct Inner {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: Arc<dyn ThreadStore>,
    pub(crate) sync: StateSynchronizer,
    /// One writer slot per state key, held from commit through persist.
    state_writers: Mutex<HashMap<StateKey, Arc<AsyncMutex<()>>>>,
    registry: RwLock<Arc<Registry>>,
    runs: Mutex<RunTable>,
    pub(crate) pending: PendingRegistry,
    pub(crate) live_tx: broadcast::Sender<RunEnvelope>,
    pub(crate) listeners: Arc<ListenerList>,
    pub(crate) listener_tx: mpsc::Sender<RunEnvelope>,
    pub(crate) metrics: Arc<RuntimeMetrics>,
    runtime: Handle,
}

impl Inner {
    /// Run a blocking store call on the blocking pool.
    pub(crate) async fn store_io<T: Send + 'static>(
        &self,
        op: impl FnOnce(&dyn ThreadStore) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| StoreError::Io(format!("store worker join failed: {err}")))?
    }

    /// Seed the synchronizer from the store the first time a key is touched.
    pub(crate) async fn ensure_seeded(&self, key: &StateKey) -> Result<(), StoreError> {
        if self.sync.versioned(key).version > 0 {
            return Ok(());
        }
        let thread_id = key.thread_id.clone();
        let thread = self.store_io(move |store| store.get(&thread_id)).await?;
        if let Some(state) = thread.agent_states.get(&key.agent) {
            self.sync.seed(key, state.clone());
        }
        Ok(())
    }

    /// Commit one synchronizer write and persist its result. Writers of
    /// the same key queue here, so the store receives states in commit
    /// order and never ends up behind the live value.
    pub(crate) async fn commit_state(
        &self,
        key: &StateKey,
        write: impl FnOnce(&StateSynchronizer) -> StateUpdate,
    ) -> Result<StateUpdate, StoreError> {
        let _writer = self.state_writer(key).await;
        let update = write(&self.sync);
        self.persist_state(key, &update.state).await?;
        Ok(update)
    }

    /// `commit_state` for an agent delta. A rejected patch leaves both the
    /// synchronizer and the store untouched.
    pub(crate) async fn commit_delta(
        &self,
        key: &StateKey,
        ops: &[PatchOp],
    ) -> Result<Result<StateUpdate, PatchError>, StoreError> {
        let _writer = self.state_writer(key).await;
        let update = match self.sync.apply_delta(key, ops) {
            Ok(update) => update,
            Err(err) => return Ok(Err(err)),
        };
        self.persist_state(key, &update.state).await?;
        Ok(Ok(update))
    }

    async fn state_writer(&self, key: &StateKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut writers = match self.state_writers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(writers.entry(key.clone()).or_default())
        };
        slot.lock_owned().await
    }

    fn forget_state_writers(&self, thread_id: &str) {
        let mut writers = match self.state_writers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writers.retain(|key, _| key.thread_id != thread_id);
    }

    async fn persist_state(&self, key: &StateKey, state: &Value) -> Result<(), StoreError> {
        let thread_id = key.thread_id.clone();
        let agent = key.agent.clone();
        let state = state.clone();
        self.store_io(move |store| store.upsert_state(&thread_id, &agent, state))
            .await
    }

    fn registry(&self) -> Arc<Registry> {
        match self.registry.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn with_registry_write<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut guard = match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(Arc::make_mut(&mut guard))
    }

    fn runs(&self) -> MutexGuard<'_, RunTable> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_status(&self, run_id: &str, status: RunStatus) {
        let mut runs = self.runs();
        let Some(entry) = runs.entries.get_mut(run_id) else {
            return;
        };
        let was_terminal = entry.status.is_terminal();
        entry.status = status;
        if status.is_terminal() && !was_terminal {
            runs.terminal.push_back(run_id.to_owned());
            while runs.terminal.len() > RETAINED_TERMINAL_RUNS {
                if let Some(oldest) = runs.terminal.pop_front() {
                    runs.entries.remove(&oldest);
                }
            }
        }
    }
}

/// Drives runs: one tokio task per run, with event fan-out, state sync,
/// tool resolution and human-in-the-loop checkpoints.
/// Cloning yields another handle to the same orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime; the listener worker and
    /// every run are spawned on it.
    pub fn new(
        mut config: RuntimeConfig,
        store: Arc<dyn ThreadStore>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            RuntimeError::InvalidConfig("orchestrator requires a tokio runtime".to_owned())
        })?;

        let metrics = Arc::new(RuntimeMetrics::new(now_unix_millis()));
        let listeners: Arc<ListenerList> =
            Arc::new(ArcSwap::from_pointee(std::mem::take(&mut config.listeners)));
        let (live_tx, _) = broadcast::channel(config.live_channel_capacity);
        let (listener_tx, listener_rx) = mpsc::channel(config.listener_channel_capacity);
        runtime.spawn(publish::listener_loop(
            Arc::clone(&listeners),
            Arc::clone(&metrics),
            listener_rx,
        ));

        let inner = Inner {
            sync: StateSynchronizer::new(config.state_update_capacity),
            state_writers: Mutex::new(HashMap::new()),
            config,
            store,
            registry: RwLock::new(Arc::new(Registry::default())),
            runs: Mutex::new(RunTable::default()),
            pending: PendingRegistry::new(Arc::clone(&metrics)),
            live_tx,
            listeners,
            listener_tx,
            metrics,
            runtime,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Adapter used when a request names no agent.
    pub fn set_default_adapter(&self, adapter: Arc<dyn AgentAdapter>) -> Result<(), RuntimeError> {
        let name = self.inner.config.default_agent_name.clone();
        ensure_compatible(&name, adapter.as_ref())?;
        self.inner
            .with_registry_write(|registry| registry.default_adapter = Some(adapter));
        Ok(())
    }

    pub fn register_agent(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn AgentAdapter>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RuntimeError::Registration(
                "agent name must not be empty".to_owned(),
            ));
        }
        if name == self.inner.config.default_agent_name {
            return Err(RuntimeError::Registration(format!(
                "agent name `{name}` is reserved for the default adapter"
            )));
        }
        ensure_compatible(&name, adapter.as_ref())?;
        self.inner.with_registry_write(|registry| {
            if registry.agents.contains_key(&name) {
                return Err(RuntimeError::Registration(format!(
                    "agent `{name}` is already registered"
                )));
            }
            registry.agents.insert(name, adapter);
            Ok(())
        })
    }

    pub fn register_tool(&self, tool: Arc<dyn BackendTool>) -> Result<(), RuntimeError> {
        self.inner
            .with_registry_write(|registry| registry.tools.register(tool))
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.inner.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    /// Every envelope of every run, as emitted. Lagging receivers skip.
    pub fn subscribe_live(&self) -> broadcast::Receiver<RunEnvelope> {
        self.inner.live_tx.subscribe()
    }

    pub fn watch_state(&self) -> broadcast::Receiver<StateUpdate> {
        self.inner.sync.watch()
    }

    /// Start a run. Tool registration problems and unknown agents are
    /// reported here, before any event is emitted.
    pub fn dispatch(&self, request: RunRequest) -> Result<RunHandle, RuntimeError> {
        if request.thread_id.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "thread_id must not be empty".to_owned(),
            ));
        }
        let registry = self.inner.registry();
        let (agent, adapter) = self.resolve_agent(&registry, request.agent.as_deref())?;
        let tools = registry.tools.resolve(&request.tools)?;
        let run_id = request.run_id.clone().unwrap_or_else(new_run_id);

        let start = RunStart::Fresh {
            message: request.message,
            ui_state: request.state,
        };
        self.spawn_run(RunTask {
            run_id,
            thread_id: request.thread_id,
            agent,
            parent_run_id: None,
            adapter,
            tools,
            context: request.context,
            start,
        })
    }

    /// Deliver a frontend tool result.
    pub fn respond(&self, tool_call_id: &str, result: Value) -> Result<(), RuntimeError> {
        self.inner
            .pending
            .complete_tool_call(tool_call_id, ToolOutcome::Success(result))
            .map(|_| ())
    }

    /// Report a frontend tool failure; the run continues with an error result.
    pub fn respond_error(
        &self,
        tool_call_id: &str,
        message: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.inner
            .pending
            .complete_tool_call(tool_call_id, ToolOutcome::Failure(message.into()))
            .map(|_| ())
    }

    /// Continue an interrupted run from its checkpoint with `payload`.
    ///
    /// Taking the checkpoint out of the store is the claim: of two resumes
    /// racing on one checkpoint, exactly one succeeds and the other gets
    /// `CheckpointNotFound`. The winner hands the payload to the live run
    /// when one still waits, and starts a continuation run otherwise.
    pub async fn resume(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        payload: Value,
    ) -> Result<ResumeOutcome, RuntimeError> {
        let owned_thread = thread_id.to_owned();
        let owned_checkpoint = checkpoint_id.to_owned();
        let checkpoint = self
            .inner
            .store_io(move |store| store.take_checkpoint(&owned_thread, &owned_checkpoint))
            .await
            .map_err(|err| match err {
                StoreError::CheckpointNotFound(id) => RuntimeError::CheckpointNotFound(id),
                other => RuntimeError::Store(other),
            })?;

        if let Some(run_id) =
            self.inner
                .pending
                .complete_resume(thread_id, checkpoint_id, payload.clone())
        {
            return Ok(ResumeOutcome::Resumed { run_id });
        }

        let registry = self.inner.registry();
        let agent_name = checkpoint.agent.clone();
        let lookup = (agent_name != self.inner.config.default_agent_name)
            .then_some(agent_name.as_str());
        let (agent, adapter) = match self.resolve_agent(&registry, lookup) {
            Ok(found) => found,
            Err(err) => {
                self.restore_checkpoint(thread_id, checkpoint).await;
                return Err(err);
            }
        };
        let tools = registry.tools.resolve(&[])?;
        tracing::debug!(
            thread_id,
            checkpoint_id,
            parent_run_id = %checkpoint.run_id,
            "resuming stored checkpoint in a continuation run"
        );
        let handle = self.spawn_run(RunTask {
            run_id: new_run_id(),
            thread_id: thread_id.to_owned(),
            agent,
            parent_run_id: Some(checkpoint.run_id.clone()),
            adapter,
            tools,
            context: Vec::new(),
            start: RunStart::Continue {
                checkpoint,
                payload,
            },
        })?;
        Ok(ResumeOutcome::Continued(handle))
    }

    /// Cancel a run. Cancelling a terminal run is a no-op.
    pub fn cancel(&self, run_id: &str) -> Result<(), RuntimeError> {
        let runs = self.inner.runs();
        let entry = runs
            .entries
            .get(run_id)
            .ok_or_else(|| RuntimeError::RunNotFound(run_id.to_owned()))?;
        if !entry.status.is_terminal() {
            entry.cancel.cancel();
        }
        Ok(())
    }

    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.inner
            .runs()
            .entries
            .get(run_id)
            .map(|entry| entry.status)
    }

    /// Ids of the thread's runs that have not terminated.
    pub fn active_runs(&self, thread_id: &str) -> Vec<String> {
        let runs = self.inner.runs();
        let mut ids: Vec<String> = runs
            .entries
            .iter()
            .filter(|(_, entry)| entry.thread_id == thread_id && !entry.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Persisted history, for reconnecting clients.
    pub async fn thread(&self, thread_id: &str) -> Result<Thread, RuntimeError> {
        let thread_id = thread_id.to_owned();
        Ok(self
            .inner
            .store_io(move |store| store.get(&thread_id))
            .await?)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<bool, RuntimeError> {
        let owned = thread_id.to_owned();
        let existed = self.inner.store_io(move |store| store.delete(&owned)).await?;
        self.inner.sync.forget_thread(thread_id);
        self.inner.forget_state_writers(thread_id);
        Ok(existed)
    }

    /// Current synchronized state of one (thread, agent) pair.
    pub async fn state_snapshot(
        &self,
        thread_id: &str,
        agent: &str,
    ) -> Result<Value, RuntimeError> {
        let key = StateKey::new(thread_id, agent);
        self.inner.ensure_seeded(&key).await?;
        Ok(self.inner.sync.snapshot(&key).as_ref().clone())
    }

    /// UI-originated write, applied in receipt order with agent writes.
    pub async fn merge_local_state(
        &self,
        thread_id: &str,
        agent: &str,
        partial: &Value,
    ) -> Result<Value, RuntimeError> {
        let key = StateKey::new(thread_id, agent);
        self.inner.ensure_seeded(&key).await?;
        let update = self
            .inner
            .commit_state(&key, |sync| sync.merge_local(&key, partial))
            .await?;
        Ok(update.state.as_ref().clone())
    }

    pub fn metrics_snapshot(&self) -> RuntimeMetricsSnapshot {
        self.inner.metrics.snapshot(now_unix_millis())
    }

    fn resolve_agent(
        &self,
        registry: &Registry,
        name: Option<&str>,
    ) -> Result<(String, Arc<dyn AgentAdapter>), RuntimeError> {
        let default_name = &self.inner.config.default_agent_name;
        match name {
            Some(name) if name != default_name => registry
                .agents
                .get(name)
                .map(|adapter| (name.to_owned(), Arc::clone(adapter)))
                .ok_or_else(|| RuntimeError::AgentNotFound(name.to_owned())),
            _ => registry
                .default_adapter
                .as_ref()
                .map(|adapter| (default_name.clone(), Arc::clone(adapter)))
                .ok_or_else(|| RuntimeError::AgentNotFound(default_name.clone())),
        }
    }

    fn spawn_run(&self, task: RunTask) -> Result<RunHandle, RuntimeError> {
        let (events_tx, events_rx) = mpsc::channel(self.inner.config.run_channel_capacity);
        let cancel = CancellationToken::new();
        {
            let mut runs = self.inner.runs();
            if runs.entries.contains_key(&task.run_id) {
                return Err(RuntimeError::InvalidRequest(format!(
                    "run id already in use: {}",
                    task.run_id
                )));
            }
            runs.entries.insert(
                task.run_id.clone(),
                RunEntry {
                    thread_id: task.thread_id.clone(),
                    status: RunStatus::Pending,
                    cancel: cancel.clone(),
                },
            );
        }

        let handle = RunHandle {
            run_id: task.run_id.clone(),
            thread_id: task.thread_id.clone(),
            events: events_rx,
            cancel: cancel.clone(),
        };
        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .spawn(run_loop::drive(inner, task, events_tx, cancel));
        Ok(handle)
    }

    async fn restore_checkpoint(&self, thread_id: &str, checkpoint: Checkpoint) {
        let owned = thread_id.to_owned();
        if let Err(err) = self
            .inner
            .store_io(move |store| store.save_checkpoint(&owned, checkpoint))
            .await
        {
            tracing::warn!(thread_id, error = %err, "failed to restore checkpoint");
        }
    }
}

fn ensure_compatible(name: &str, adapter: &dyn AgentAdapter) -> Result<(), RuntimeError> {
    let actual = adapter.contract_version();
    if ProtocolVersion::CURRENT.is_compatible_with(actual) {
        return Ok(());
    }
    Err(RuntimeError::IncompatibleProtocol {
        agent: name.to_owned(),
        expected: format!(
            "{}.{}",
            ProtocolVersion::CURRENT.major,
            ProtocolVersion::CURRENT.minor
        ),
        actual: format!("{}.{}", actual.major, actual.minor),
    })
}

pub(crate) fn new_run_id() -> String {
    format!("run_{}", Uuid::new_v4())
}

pub(crate) fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4())
}

pub(crate) fn new_checkpoint_id() -> String {
    format!("ckpt_{}", Uuid::new_v4())
}

pub(crate) fn now_unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(_) => 0,
    }
}
