use agentsync_protocol::{
    CodecError, ContextItem, Framing, Message, ParameterKind, Role, ToolDefinition, ToolParameter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RuntimeError;
use crate::events::RunEnvelope;
use crate::orchestrator::RunRequest;

/// Tool as declared in an HTTP run request. `parameters` is either a list
/// of parameter descriptors or a JSON-schema object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// HTTP run request body as sent by event-stream clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentInput {
    pub thread_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<WireTool>,
    #[serde(default)]
    pub context: Vec<ContextItem>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub agent: Option<String>,
    /// Opaque client data; not interpreted.
    #[serde(default)]
    pub forwarded_props: Value,
}

impl RunAgentInput {
    pub fn from_json(body: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(body)
            .map_err(|err| RuntimeError::InvalidRequest(format!("malformed run input: {err}")))
    }

    /// The store's history is authoritative, so only a trailing user
    /// message is taken as the new message. An empty state object counts
    /// as no state.
    pub fn into_request(self) -> Result<RunRequest, RuntimeError> {
        let tools = self
            .tools
            .into_iter()
            .map(WireTool::into_definition)
            .collect::<Result<Vec<_>, _>>()?;
        let message = self
            .messages
            .into_iter()
            .last()
            .filter(|message| message.role == Role::User);
        let state = self
            .state
            .filter(|state| {
                !state.is_null() && state.as_object().map_or(true, |map| !map.is_empty())
            });
        Ok(RunRequest {
            thread_id: self.thread_id,
            run_id: self.run_id,
            agent: self.agent,
            message,
            context: self.context,
            tools,
            state,
        })
    }
}

impl WireTool {
    pub fn into_definition(self) -> Result<ToolDefinition, RuntimeError> {
        let parameters = match self.parameters {
            Value::Null => Vec::new(),
            Value::Array(_) => serde_json::from_value(self.parameters).map_err(|err| {
                RuntimeError::InvalidRequest(format!(
                    "tool `{}` has malformed parameters: {err}",
                    self.name
                ))
            })?,
            Value::Object(schema) => schema_parameters(&self.name, &schema)?,
            other => {
                return Err(RuntimeError::InvalidRequest(format!(
                    "tool `{}` parameters must be a list or a schema object, got {other}",
                    self.name
                )))
            }
        };
        Ok(ToolDefinition {
            name: self.name,
            description: self.description,
            parameters,
        })
    }
}

fn schema_parameters(
    tool: &str,
    schema: &serde_json::Map<String, Value>,
) -> Result<Vec<ToolParameter>, RuntimeError> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let mut parameters = Vec::with_capacity(properties.len());
    for (name, property) in properties {
        let kind = property
            .get("type")
            .and_then(Value::as_str)
            .and_then(parse_kind)
            .ok_or_else(|| {
                RuntimeError::InvalidRequest(format!(
                    "tool `{tool}` parameter `{name}` has no supported type"
                ))
            })?;
        let mut parameter = ToolParameter::new(name, kind);
        if let Some(description) = property.get("description").and_then(Value::as_str) {
            parameter = parameter.with_description(description);
        }
        if required.contains(&name.as_str()) {
            parameter = parameter.required();
        }
        parameters.push(parameter);
    }
    Ok(parameters)
}

fn parse_kind(name: &str) -> Option<ParameterKind> {
    match name {
        "string" => Some(ParameterKind::String),
        "number" => Some(ParameterKind::Number),
        "integer" => Some(ParameterKind::Integer),
        "boolean" => Some(ParameterKind::Boolean),
        "object" => Some(ParameterKind::Object),
        "array" => Some(ParameterKind::Array),
        _ => None,
    }
}

/// Frame one relayed event for an HTTP event-stream response.
pub fn encode_envelope(framing: Framing, envelope: &RunEnvelope) -> Result<String, CodecError> {
    framing.encode(&envelope.event)
}
