use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use agentsync_protocol::{
    ContextItem, Event, Message, ProtocolError, StreamValidator, ToolCall, ToolDefinition,
};
use agentsync_state::StateKey;
use agentsync_store::{Checkpoint, StoreError};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::assembler::MessageAssembler;
use super::publish::Publisher;
use super::{new_checkpoint_id, new_message_id, now_unix_millis, Inner, RunStatus, ToolOutcome};
use crate::adapter::{
    AgentAdapter, AgentInput, AgentOutput, AgentStream, InterruptRequest, ResumeInput,
};
use crate::errors::{AdapterError, RunFailure, ToolError};
use crate::events::RunEnvelope;
use crate::remote::INTERRUPT_EVENT;
use crate::tools::{BackendTool, ToolContext, ToolSet, ToolTarget};

/// CUSTOM event announcing a resolved tool call.
pub const TOOL_RESULT_EVENT: &str = "tool_call_result";
/// CUSTOM event reporting an agent delta that could not be applied.
pub const STATE_DELTA_REJECTED_EVENT: &str = "state_delta_rejected";

const RUN_DEADLINE: &str = "run deadline";

pub(super) enum RunStart {
    Fresh {
        message: Option<Message>,
        ui_state: Option<Value>,
    },
    /// Continuation of a run interrupted in an earlier process.
    Continue { checkpoint: Checkpoint, payload: Value },
}

pub(super) struct RunTask {
    pub(super) run_id: String,
    pub(super) thread_id: String,
    pub(super) agent: String,
    pub(super) parent_run_id: Option<String>,
    pub(super) adapter: Arc<dyn AgentAdapter>,
    pub(super) tools: ToolSet,
    pub(super) context: Vec<ContextItem>,
    pub(super) start: RunStart,
}

type FrontendWaiters = HashMap<String, oneshot::Receiver<ToolOutcome>>;

struct StepOutcome {
    tool_calls: Vec<ToolCall>,
    frontend: FrontendWaiters,
    interrupt: Option<InterruptRequest>,
    result: Option<Value>,
}

struct Run<'a> {
    inner: &'a Inner,
    run_id: String,
    thread_id: String,
    agent: String,
    key: StateKey,
    adapter: Arc<dyn AgentAdapter>,
    tools: ToolSet,
    context: Vec<ContextItem>,
    publisher: Publisher,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    history: Vec<Message>,
    live_checkpoint: Option<String>,
}

/// Task body of one run: emits exactly one terminal event, then releases
/// every registration the run holds.
pub(super) async fn drive(
    inner: Arc<Inner>,
    task: RunTask,
    events: mpsc::Sender<RunEnvelope>,
    cancel: CancellationToken,
) {
    let RunTask {
        run_id,
        thread_id,
        agent,
        parent_run_id,
        adapter,
        tools,
        context,
        start,
    } = task;
    let deadline = inner
        .config
        .timeouts
        .run
        .map(|limit| Instant::now() + limit);
    let mut run = Run {
        inner: &inner,
        key: StateKey::new(&thread_id, &agent),
        publisher: Publisher::new(&thread_id, &run_id, &agent, events),
        run_id,
        thread_id,
        agent,
        adapter,
        tools,
        context,
        cancel,
        deadline,
        history: Vec::new(),
        live_checkpoint: None,
    };

    inner.metrics.record_run_started();
    inner.set_status(&run.run_id, RunStatus::Running);
    tracing::debug!(
        run_id = %run.run_id,
        thread_id = %run.thread_id,
        agent = %run.agent,
        "run started"
    );
    let outcome = run.execute(parent_run_id, start).await;
    run.finish(outcome).await;
}

impl Run<'_> {
    async fn execute(
        &mut self,
        parent_run_id: Option<String>,
        start: RunStart,
    ) -> Result<Option<Value>, RunFailure> {
        self.emit(Event::RunStarted {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            parent_run_id,
        })
        .await?;
        let mut resume = self.prepare(start).await?;

        let max_steps = self.inner.config.max_steps;
        for step in 0..max_steps {
            let outcome = self.run_step(step, resume.take()).await?;
            let had_tool_calls = !outcome.tool_calls.is_empty();
            self.resolve_tool_calls(outcome.tool_calls, outcome.frontend)
                .await?;
            if let Some(request) = outcome.interrupt {
                resume = Some(self.interrupt(request).await?);
                continue;
            }
            if !had_tool_calls {
                return Ok(outcome.result);
            }
        }
        Err(RunFailure::MaxSteps(max_steps))
    }

    /// Load history and state, then apply what the caller brought.
    async fn prepare(&mut self, start: RunStart) -> Result<Option<ResumeInput>, RunFailure> {
        let thread_id = self.thread_id.clone();
        let thread = self
            .inner
            .store_io(move |store| store.get(&thread_id))
            .await?;
        self.history = thread.messages;
        if let Some(state) = thread.agent_states.get(&self.agent) {
            self.inner.sync.seed(&self.key, state.clone());
        }

        match start {
            RunStart::Fresh { message, ui_state } => {
                if let Some(message) = message {
                    self.persist_message(message).await?;
                }
                if let Some(partial) = ui_state {
                    let key = &self.key;
                    self.inner
                        .commit_state(key, |sync| sync.merge_local(key, &partial))
                        .await?;
                }
                Ok(None)
            }
            RunStart::Continue {
                checkpoint,
                payload,
            } => {
                self.inner.sync.seed(&self.key, checkpoint.pending_state);
                self.apply_resume_payload(&payload).await?;
                Ok(Some(ResumeInput {
                    checkpoint_id: checkpoint.checkpoint_id,
                    node_id: checkpoint.node_id,
                    payload,
                }))
            }
        }
    }

    async fn run_step(
        &mut self,
        step: u32,
        resume: Option<ResumeInput>,
    ) -> Result<StepOutcome, RunFailure> {
        let input = AgentInput {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            agent: self.agent.clone(),
            step,
            messages: self.history.clone(),
            context: self.context.clone(),
            tools: self.tools.definitions(),
            state: self.inner.sync.snapshot(&self.key).as_ref().clone(),
            resume,
        };
        tracing::debug!(run_id = %self.run_id, step, "calling adapter");
        let mut stream = self.adapter.run(input);
        let mut assembler = MessageAssembler::default();
        let mut outcome = StepOutcome {
            tool_calls: Vec::new(),
            frontend: HashMap::new(),
            interrupt: None,
            result: None,
        };

        let drained = self
            .drain_step(&mut stream, &mut assembler, &mut outcome)
            .await;
        drop(stream);
        if let Err(failure) = drained {
            let dropped = assembler.discard_open();
            if let Err(err) = self.flush(&mut assembler).await {
                tracing::warn!(
                    run_id = %self.run_id,
                    error = %err,
                    "failed to persist finalized messages of a failed step"
                );
            }
            tracing::debug!(
                run_id = %self.run_id,
                step,
                dropped,
                "discarded unfinished messages"
            );
            return Err(failure);
        }
        outcome.tool_calls = self.flush(&mut assembler).await?;
        Ok(outcome)
    }

    async fn drain_step(
        &mut self,
        stream: &mut AgentStream,
        assembler: &mut MessageAssembler,
        outcome: &mut StepOutcome,
    ) -> Result<(), RunFailure> {
        let mut validator = StreamValidator::step();
        let chunk_timeout = self.inner.config.timeouts.adapter_chunk;
        loop {
            let Some(item) = self
                .guard("adapter chunk", chunk_timeout, stream.next())
                .await?
            else {
                validator.finish()?;
                return Ok(());
            };
            let event = match item? {
                AgentOutput::Event(event) => event,
                AgentOutput::Interrupt(request) => {
                    validator.finish()?;
                    outcome.interrupt = Some(request);
                    return Ok(());
                }
            };
            validator.observe(&event)?;
            if let Event::ToolCallStart {
                tool_call_id,
                tool_call_name,
                ..
            } = &event
            {
                self.admit_tool_call(tool_call_id, tool_call_name, outcome)?;
            }

            match event {
                Event::RunStarted { .. } => {}
                Event::RunFinished { result, .. } => outcome.result = result,
                Event::RunError { message, code } => {
                    return Err(AdapterError::Remote { message, code }.into());
                }
                Event::StateSnapshot { snapshot } => {
                    let key = &self.key;
                    let update = self
                        .inner
                        .commit_state(key, |sync| sync.apply_snapshot(key, snapshot))
                        .await?;
                    self.emit(Event::StateSnapshot {
                        snapshot: update.state.as_ref().clone(),
                    })
                    .await?;
                }
                Event::StateDelta { delta } => {
                    match self.inner.commit_delta(&self.key, &delta).await? {
                        Ok(_) => self.emit(Event::StateDelta { delta }).await?,
                        Err(err) => {
                            self.inner.metrics.record_state_delta_rejected();
                            tracing::warn!(
                                run_id = %self.run_id,
                                thread_id = %self.thread_id,
                                error = %err,
                                "rejected agent state delta"
                            );
                            self.emit(Event::custom(
                                STATE_DELTA_REJECTED_EVENT,
                                json!({ "error": err.to_string(), "delta": delta }),
                            ))
                            .await?;
                        }
                    }
                }
                other => {
                    assembler.observe(&other);
                    self.emit(other).await?;
                }
            }
        }
    }

    /// Unknown tools fail the run before their START is relayed. Frontend
    /// calls get their result waiter here so an early `respond` is kept.
    fn admit_tool_call(
        &self,
        tool_call_id: &str,
        tool_call_name: &str,
        outcome: &mut StepOutcome,
    ) -> Result<(), RunFailure> {
        match self.tools.get(tool_call_name) {
            None => Err(RunFailure::ToolNotFound(tool_call_name.to_owned())),
            Some(ToolTarget::Frontend(_)) => {
                let waiter = self
                    .inner
                    .pending
                    .register_tool_call(&self.run_id, tool_call_id)
                    .ok_or_else(|| ProtocolError::DuplicateId {
                        kind: "tool call".to_owned(),
                        id: tool_call_id.to_owned(),
                    })?;
                outcome.frontend.insert(tool_call_id.to_owned(), waiter);
                Ok(())
            }
            Some(ToolTarget::Backend(..)) => Ok(()),
        }
    }

    /// Persist everything the assembler finalized; returns its tool calls.
    async fn flush(
        &mut self,
        assembler: &mut MessageAssembler,
    ) -> Result<Vec<ToolCall>, RunFailure> {
        let finalized = assembler.take_finalized(new_message_id);
        for message in finalized.messages {
            self.persist_message(message).await?;
        }
        Ok(finalized.tool_calls)
    }

    async fn resolve_tool_calls(
        &mut self,
        calls: Vec<ToolCall>,
        mut frontend: FrontendWaiters,
    ) -> Result<(), RunFailure> {
        for call in calls {
            let outcome = match self.tools.get(&call.name).cloned() {
                None => return Err(RunFailure::ToolNotFound(call.name)),
                Some(ToolTarget::Frontend(_)) => {
                    let waiter = frontend
                        .remove(&call.id)
                        .ok_or_else(|| RunFailure::ToolNotFound(call.name.clone()))?;
                    tracing::debug!(
                        run_id = %self.run_id,
                        tool_call_id = %call.id,
                        "awaiting frontend tool result"
                    );
                    let timeout = self.inner.config.timeouts.frontend_tool;
                    match self.guard("frontend tool result", timeout, waiter).await? {
                        Ok(outcome) => outcome,
                        Err(_) => ToolOutcome::Failure("tool call was abandoned".to_owned()),
                    }
                }
                Some(ToolTarget::Backend(definition, tool)) => {
                    self.call_backend(&call, &definition, tool.as_ref()).await?
                }
            };
            self.record_tool_result(&call, outcome).await?;
        }
        Ok(())
    }

    /// A failing or timed-out backend tool yields an error result; only
    /// cancellation and the run deadline end the run.
    async fn call_backend(
        &self,
        call: &ToolCall,
        definition: &ToolDefinition,
        tool: &dyn BackendTool,
    ) -> Result<ToolOutcome, RunFailure> {
        let arguments = match validated_arguments(call, definition) {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::debug!(
                    run_id = %self.run_id,
                    tool_call_id = %call.id,
                    tool = %call.name,
                    error = %err,
                    "rejected backend tool arguments"
                );
                return Ok(ToolOutcome::Failure(err.to_string()));
            }
        };

        let ctx = ToolContext {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            tool_call_id: call.id.clone(),
            context: self.context.clone(),
            state: self.inner.sync.snapshot(&self.key),
        };
        let timeout = self.inner.config.timeouts.backend_tool;
        match self.guard("backend tool", timeout, tool.call(arguments, &ctx)).await {
            Ok(Ok(value)) => Ok(ToolOutcome::Success(value)),
            Ok(Err(err)) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    tool_call_id = %call.id,
                    tool = %call.name,
                    error = %err,
                    "backend tool failed"
                );
                Ok(ToolOutcome::Failure(err.to_string()))
            }
            Err(RunFailure::Timeout(what)) if what != RUN_DEADLINE => {
                tracing::warn!(
                    run_id = %self.run_id,
                    tool_call_id = %call.id,
                    tool = %call.name,
                    "backend tool timed out"
                );
                Ok(ToolOutcome::Failure(format!("timed out waiting for {what}")))
            }
            Err(failure) => Err(failure),
        }
    }

    async fn record_tool_result(
        &mut self,
        call: &ToolCall,
        outcome: ToolOutcome,
    ) -> Result<(), RunFailure> {
        let (result, is_error) = match outcome {
            ToolOutcome::Success(value) => (value, false),
            ToolOutcome::Failure(message) => (json!({ "error": message }), true),
        };
        let content = match &result {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        self.persist_message(Message::tool_result(new_message_id(), &call.id, content))
            .await?;
        self.emit(Event::custom(
            TOOL_RESULT_EVENT,
            json!({
                "toolCallId": call.id,
                "toolName": call.name,
                "result": result,
                "isError": is_error,
            }),
        ))
        .await
    }

    /// Checkpoint, announce, and wait for the resume payload.
    async fn interrupt(&mut self, request: InterruptRequest) -> Result<ResumeInput, RunFailure> {
        if let Some(state) = request.state {
            let key = &self.key;
            let update = self
                .inner
                .commit_state(key, |sync| sync.apply_snapshot(key, state))
                .await?;
            self.emit(Event::StateSnapshot {
                snapshot: update.state.as_ref().clone(),
            })
            .await?;
        }

        let checkpoint_id = new_checkpoint_id();
        let checkpoint = Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            run_id: self.run_id.clone(),
            agent: self.agent.clone(),
            node_id: request.node_id.clone(),
            value: request.value.clone(),
            pending_state: self.inner.sync.snapshot(&self.key).as_ref().clone(),
            created_at_ms: now_unix_millis(),
        };
        let waiter = self
            .inner
            .pending
            .register_resume(&self.run_id, &self.thread_id, &checkpoint_id);
        let thread_id = self.thread_id.clone();
        self.inner
            .store_io(move |store| store.save_checkpoint(&thread_id, checkpoint))
            .await?;
        self.live_checkpoint = Some(checkpoint_id.clone());
        self.inner.set_status(&self.run_id, RunStatus::Interrupted);
        self.inner.metrics.record_run_interrupted();
        self.emit(Event::custom(
            INTERRUPT_EVENT,
            json!({
                "checkpointId": checkpoint_id,
                "nodeId": request.node_id,
                "value": request.value,
            }),
        ))
        .await?;
        tracing::debug!(
            run_id = %self.run_id,
            checkpoint_id = %checkpoint_id,
            node_id = %request.node_id,
            "run interrupted"
        );

        let timeout = self.inner.config.timeouts.resume;
        let payload = self
            .guard("resume", timeout, waiter)
            .await?
            .map_err(|_| RunFailure::Cancelled)?;

        // The resumer took the checkpoint out of the store.
        self.live_checkpoint = None;
        self.inner.set_status(&self.run_id, RunStatus::Running);
        self.apply_resume_payload(&payload).await?;
        Ok(ResumeInput {
            checkpoint_id,
            node_id: request.node_id,
            payload,
        })
    }

    /// Object payloads are merged into the state; anything else only
    /// reaches the adapter.
    async fn apply_resume_payload(&mut self, payload: &Value) -> Result<(), RunFailure> {
        if !payload.is_object() {
            return Ok(());
        }
        let key = &self.key;
        let update = self
            .inner
            .commit_state(key, |sync| sync.merge_local(key, payload))
            .await?;
        self.emit(Event::StateSnapshot {
            snapshot: update.state.as_ref().clone(),
        })
        .await
    }

    async fn release_checkpoint(&mut self) -> Result<(), StoreError> {
        let Some(checkpoint_id) = self.live_checkpoint.take() else {
            return Ok(());
        };
        let thread_id = self.thread_id.clone();
        match self
            .inner
            .store_io(move |store| store.take_checkpoint(&thread_id, &checkpoint_id))
            .await
        {
            Ok(_) | Err(StoreError::CheckpointNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn persist_message(&mut self, message: Message) -> Result<(), StoreError> {
        let thread_id = self.thread_id.clone();
        let stored = message.clone();
        self.inner
            .store_io(move |store| store.append_message(&thread_id, stored))
            .await?;
        self.history.push(message);
        Ok(())
    }

    async fn emit(&mut self, event: Event) -> Result<(), RunFailure> {
        self.publisher
            .emit(self.inner, &self.cancel, event)
            .await
            .map_err(RunFailure::from)
    }

    /// Await `fut` unless the run is cancelled or the earlier of `limit`
    /// and the run deadline passes.
    async fn guard<F: Future>(
        &self,
        label: &str,
        limit: Option<Duration>,
        fut: F,
    ) -> Result<F::Output, RunFailure> {
        let local = limit.map(|limit| Instant::now() + limit);
        let (deadline, what) = match (local, self.deadline) {
            (Some(local), Some(run)) if run < local => (Some(run), RUN_DEADLINE),
            (Some(local), _) => (Some(local), label),
            (None, run) => (run, RUN_DEADLINE),
        };
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunFailure::Cancelled),
            _ = expiry => Err(RunFailure::Timeout(what.to_owned())),
            output = fut => Ok(output),
        }
    }

    async fn finish(mut self, outcome: Result<Option<Value>, RunFailure>) {
        self.inner.pending.release_run(&self.run_id);
        if let Err(err) = self.release_checkpoint().await {
            tracing::warn!(
                run_id = %self.run_id,
                error = %err,
                "failed to remove checkpoint of a terminated run"
            );
        }

        // Terminal status is visible before the terminal event.
        let failure = match outcome {
            Ok(result) => {
                self.inner.set_status(&self.run_id, RunStatus::Finished);
                let finished = Event::RunFinished {
                    thread_id: self.thread_id.clone(),
                    run_id: self.run_id.clone(),
                    result,
                };
                match self.emit(finished).await {
                    Ok(()) => {
                        self.inner.metrics.record_run_finished();
                        tracing::debug!(run_id = %self.run_id, "run finished");
                        return;
                    }
                    Err(failure) => failure,
                }
            }
            Err(failure) => failure,
        };

        self.inner.metrics.record_run_errored();
        self.inner.set_status(&self.run_id, RunStatus::Errored);
        tracing::debug!(
            run_id = %self.run_id,
            code = failure.code(),
            error = %failure,
            "run errored"
        );
        if self.publisher.is_terminated() {
            return;
        }
        let event = Event::RunError {
            message: failure.to_string(),
            code: Some(failure.code().to_owned()),
        };
        if let Err(err) = self.emit(event).await {
            tracing::warn!(
                run_id = %self.run_id,
                error = %err,
                "failed to emit RUN_ERROR"
            );
        }
    }
}

fn validated_arguments(call: &ToolCall, definition: &ToolDefinition) -> Result<Value, ToolError> {
    let arguments = call
        .arguments_json()
        .map_err(|err| ToolError::InvalidArguments(format!("not valid json: {err}")))?;
    let problems = definition.argument_problems(&arguments);
    if !problems.is_empty() {
        return Err(ToolError::InvalidArguments(problems.join("; ")));
    }
    Ok(arguments)
}
