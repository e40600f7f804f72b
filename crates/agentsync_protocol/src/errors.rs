use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream contract violation. Fatal to the run that produced it.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolError {
    #[error("{event} received before RUN_STARTED")]
    NotStarted { event: String },
    #[error("duplicate RUN_STARTED")]
    DuplicateRunStarted,
    #[error("{event} received after terminal event")]
    AfterTerminal { event: String },
    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: String, id: String },
    #[error("{event} for {id} outside its START/END window")]
    NotOpen { event: String, id: String },
    #[error("unclosed {kind} at {at}: {ids:?}")]
    Unclosed {
        kind: String,
        at: String,
        ids: Vec<String>,
    },
    #[error("stream ended without RUN_FINISHED or RUN_ERROR")]
    MissingTerminal,
    #[error("step {step} is not open")]
    StepNotOpen { step: String },
    #[error("step {step} started twice")]
    DuplicateStep { step: String },
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CodecError {
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("malformed frame: {reason}")]
    Malformed { reason: String, frame: String },
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ToolSchemaError {
    #[error("tool name must not be empty")]
    EmptyName,
    #[error("invalid tool name: {0}")]
    InvalidName(String),
    #[error("tool {tool} has a parameter with an empty name")]
    EmptyParameterName { tool: String },
    #[error("tool {tool} declares parameter {parameter} twice")]
    DuplicateParameter { tool: String, parameter: String },
}
