use agentsync_protocol::{CodecError, ProtocolError, ToolSchemaError};
use agentsync_state::PatchError;
use agentsync_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by orchestrator API calls. Failures inside a running
/// run are reported on its event stream as `RUN_ERROR` instead.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("registration error: {0}")]
    Registration(String),
    #[error("adapter {agent} speaks protocol {actual}, runtime expects {expected}")]
    IncompatibleProtocol {
        agent: String,
        expected: String,
        actual: String,
    },
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("tool call is not awaiting a result: {0}")]
    ToolCallNotPending(String),
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),
}

impl From<ToolSchemaError> for RuntimeError {
    fn from(err: ToolSchemaError) -> Self {
        Self::Registration(err.to_string())
    }
}

/// Upstream agent/LLM failure surfaced by an adapter stream.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("remote agent error: {message}")]
    Remote {
        message: String,
        code: Option<String>,
    },
    #[error("stream decode error: {0}")]
    Codec(String),
    #[error("adapter error: {0}")]
    Other(String),
}

impl From<CodecError> for AdapterError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Cause of a run's `RUN_ERROR`. Every variant terminates the run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RunFailure {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("step limit of {0} reached")]
    MaxSteps(u32),
}

impl RunFailure {
    /// Stable `RUN_ERROR.code` value.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Adapter(AdapterError::Codec(_)) => "PROTOCOL_ERROR",
            Self::Adapter(_) => "ADAPTER_ERROR",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Store(_) => "STORE_ERROR",
            Self::MaxSteps(_) => "MAX_STEPS",
        }
    }
}
