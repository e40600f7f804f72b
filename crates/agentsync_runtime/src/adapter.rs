use std::pin::Pin;

use agentsync_protocol::{ContextItem, Event, Message, ProtocolVersion, ToolDefinition};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AdapterError;

pub type AgentStream =
    Pin<Box<dyn Stream<Item = Result<AgentOutput, AdapterError>> + Send + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Direct LLM provider integration.
    Llm,
    /// Agent reached over a byte stream (see `RemoteAgentAdapter`).
    Remote,
    /// In-process agent graph.
    Local,
}

/// Re-entry point handed to the adapter after a human-in-the-loop pause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInput {
    pub checkpoint_id: String,
    pub node_id: String,
    pub payload: Value,
}

/// Everything one adapter step sees. Built fresh for every step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub thread_id: String,
    pub run_id: String,
    pub agent: String,
    /// Zero-based adapter invocation index within the run.
    pub step: u32,
    pub messages: Vec<Message>,
    pub context: Vec<ContextItem>,
    pub tools: Vec<ToolDefinition>,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeInput>,
}

/// Request to pause the run at `node_id` until the caller resumes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    pub node_id: String,
    #[serde(default)]
    pub value: Value,
    /// State to record as the checkpoint's pending state. Defaults to the
    /// current synchronized state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentOutput {
    Event(Event),
    /// Ends the current step; the stream is not polled further.
    Interrupt(InterruptRequest),
}

impl From<Event> for AgentOutput {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Execution target capability: given messages, context, tools and state,
/// produce an event stream. Implementations are looked up by agent name.
pub trait AgentAdapter: Send + Sync + 'static {
    fn kind(&self) -> AgentKind {
        AgentKind::Llm
    }

    /// Event contract this adapter was built against.
    fn contract_version(&self) -> ProtocolVersion {
        ProtocolVersion::CURRENT
    }

    /// Start one step. Run lifecycle events in the stream are optional and
    /// absorbed by the orchestrator; a `RUN_ERROR` ends the run.
    fn run(&self, input: AgentInput) -> AgentStream;
}
