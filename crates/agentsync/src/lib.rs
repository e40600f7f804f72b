//! Public facade for the agentsync workspace.
//! Default path: `Copilot` over one adapter. Use `agentsync::runtime` for
//! the orchestrator, `agentsync::state` and `agentsync::store` for the layers
//! underneath it.

mod ergonomic;

pub use agentsync_protocol::{
    ContextItem, Event, Framing, Message, ParameterKind, PatchOp, ProtocolVersion, Role,
    StreamValidator, ToolCall, ToolDefinition, ToolParameter,
};
pub use agentsync_runtime::{
    encode_envelope, AdapterError, AgentAdapter, AgentInput, AgentKind, AgentOutput, AgentStream,
    AgentTransport, BackendTool, EventListener, FnTool, InterruptRequest, JsonlFileSink,
    Orchestrator, RemoteAgentAdapter, ResumeInput, ResumeOutcome, RunAgentInput, RunEnvelope,
    RunHandle, RunRequest, RunStatus, RunTimeouts, RuntimeConfig, RuntimeError,
    RuntimeMetricsSnapshot, ToolContext, ToolError, ToolOutcome, INTERRUPT_EVENT,
    STATE_DELTA_REJECTED_EVENT, TOOL_RESULT_EVENT,
};
pub use agentsync_state::{StateUpdate, WriteOrigin};
pub use agentsync_store::{Checkpoint, FsThreadStore, MemoryThreadStore, Thread, ThreadStore};
pub use ergonomic::{
    quick_ask, AskError, Copilot, CopilotConfig, Reply, StoreLocation, STORE_DIR_ENV,
};

pub use agentsync_protocol as protocol;
pub use agentsync_runtime as runtime;
pub use agentsync_state as state;
pub use agentsync_store as store;
