#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentsync_protocol::{Event, Role};
use agentsync_runtime::{
    AdapterError, AgentAdapter, AgentInput, AgentOutput, AgentStream, InterruptRequest,
    Orchestrator, RunHandle, RuntimeConfig,
};
use agentsync_store::{MemoryThreadStore, ThreadStore};
use futures::stream::{self, StreamExt};
use serde_json::Value;

pub const QUIET: Duration = Duration::from_millis(50);

/// One adapter step: items in order, then either end or stay open forever.
pub struct StepScript {
    items: Vec<Result<AgentOutput, AdapterError>>,
    hang: bool,
}

impl StepScript {
    pub fn new(items: Vec<Result<AgentOutput, AdapterError>>) -> Self {
        Self { items, hang: false }
    }

    pub fn events(events: Vec<Event>) -> Self {
        Self::new(events.into_iter().map(|event| Ok(event.into())).collect())
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Adapter replaying one script per step and recording every input.
#[derive(Default)]
pub struct ScriptedAdapter {
    steps: Mutex<VecDeque<StepScript>>,
    inputs: Mutex<Vec<AgentInput>>,
}

impl ScriptedAdapter {
    pub fn new(steps: Vec<StepScript>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn inputs(&self) -> Vec<AgentInput> {
        self.inputs.lock().expect("inputs lock").clone()
    }
}

impl AgentAdapter for ScriptedAdapter {
    fn run(&self, input: AgentInput) -> AgentStream {
        self.inputs.lock().expect("inputs lock").push(input);
        let script = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or_else(|| StepScript::new(Vec::new()));
        let items = stream::iter(script.items);
        if script.hang {
            Box::pin(items.chain(stream::pending()))
        } else {
            Box::pin(items)
        }
    }
}

pub fn text_message(id: &str, chunks: &[&str]) -> Vec<Event> {
    let mut events = vec![Event::TextMessageStart {
        message_id: id.to_owned(),
        role: Role::Assistant,
    }];
    for chunk in chunks {
        events.push(Event::TextMessageContent {
            message_id: id.to_owned(),
            delta: (*chunk).to_owned(),
        });
    }
    events.push(Event::TextMessageEnd {
        message_id: id.to_owned(),
    });
    events
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> Vec<Event> {
    vec![
        Event::ToolCallStart {
            tool_call_id: id.to_owned(),
            tool_call_name: name.to_owned(),
            parent_message_id: None,
        },
        Event::ToolCallArgs {
            tool_call_id: id.to_owned(),
            delta: arguments.to_owned(),
        },
        Event::ToolCallEnd {
            tool_call_id: id.to_owned(),
        },
    ]
}

pub fn interrupt(node_id: &str, value: Value) -> Result<AgentOutput, AdapterError> {
    Ok(AgentOutput::Interrupt(InterruptRequest {
        node_id: node_id.to_owned(),
        value,
        state: None,
    }))
}

pub fn memory_store() -> Arc<MemoryThreadStore> {
    Arc::new(MemoryThreadStore::new())
}

pub fn orchestrator(
    config: RuntimeConfig,
    store: Arc<dyn ThreadStore>,
    adapter: Arc<dyn AgentAdapter>,
) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, store).expect("orchestrator");
    orchestrator
        .set_default_adapter(adapter)
        .expect("default adapter");
    orchestrator
}

pub fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::name).collect()
}

pub fn custom_value(events: &[Event], wanted: &str) -> Option<Value> {
    events.iter().find_map(|event| match event {
        Event::Custom { name, value } if name == wanted => Some(value.clone()),
        _ => None,
    })
}

pub fn error_code(events: &[Event]) -> Option<String> {
    events.iter().find_map(|event| match event {
        Event::RunError { code, .. } => code.clone(),
        _ => None,
    })
}

/// Asserts the run emits nothing for a short while.
pub async fn assert_quiet(handle: &mut RunHandle) {
    let next = tokio::time::timeout(QUIET, handle.next()).await;
    assert!(next.is_err(), "expected a suspended run, got {next:?}");
}
