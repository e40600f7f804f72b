pub mod adapter;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod remote;
pub mod sink;
pub mod tools;
pub mod wire;

pub use adapter::{
    AgentAdapter, AgentInput, AgentKind, AgentOutput, AgentStream, InterruptRequest, ResumeInput,
};
pub use config::{
    RunTimeouts, RuntimeConfig, DEFAULT_AGENT_NAME, MAX_STEPS_ENV, RUN_TIMEOUT_ENV,
    TOOL_TIMEOUT_ENV,
};
pub use errors::{AdapterError, RunFailure, RuntimeError, SinkError, ToolError};
pub use events::RunEnvelope;
pub use metrics::RuntimeMetricsSnapshot;
pub use orchestrator::{
    Orchestrator, ResumeOutcome, RunHandle, RunRequest, RunStatus, ToolOutcome,
    STATE_DELTA_REJECTED_EVENT, TOOL_RESULT_EVENT,
};
pub use remote::{AgentTransport, ByteStream, ConnectFuture, RemoteAgentAdapter, INTERRUPT_EVENT};
pub use sink::{EventListener, JsonlFileSink, ListenerFuture};
pub use tools::{BackendTool, FnTool, ToolContext, ToolFuture, ToolRegistry};
pub use wire::{encode_envelope, RunAgentInput, WireTool};
