use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One streamed tool invocation attached to an assistant message.
/// `arguments` is the concatenation of every `TOOL_CALL_ARGS` delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    /// Parse finalized arguments. Empty argument text is treated as `{}`.
    pub fn arguments_json(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` messages: the tool call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    pub fn tool_result(
        id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(id, Role::Tool, content)
        }
    }
}

/// Read-only, run-scoped information supplied by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub description: String,
    pub value: Value,
}

impl ContextItem {
    pub fn new(description: impl Into<String>, value: Value) -> Self {
        Self {
            description: description.into(),
            value,
        }
    }
}

/// One operation of a `STATE_DELTA` patch, addressed by JSON pointer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Closed event vocabulary. Serialized with a `type` discriminator
/// (`RUN_STARTED`, `TEXT_MESSAGE_CONTENT`, ...) and camelCase fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        thread_id: String,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished {
        thread_id: String,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TextMessageStart { message_id: String, role: Role },
    #[serde(rename_all = "camelCase")]
    TextMessageContent { message_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    TextMessageEnd { message_id: String },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallArgs { tool_call_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call_id: String },
    StateSnapshot { snapshot: Value },
    StateDelta { delta: Vec<PatchOp> },
    MessagesSnapshot { messages: Vec<Message> },
    Custom { name: String, value: Value },
    Raw {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepStarted { step_name: String },
    #[serde(rename_all = "camelCase")]
    StepFinished { step_name: String },
}

impl Event {
    /// Wire discriminator of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Self::StateDelta { .. } => "STATE_DELTA",
            Self::MessagesSnapshot { .. } => "MESSAGES_SNAPSHOT",
            Self::Custom { .. } => "CUSTOM",
            Self::Raw { .. } => "RAW",
            Self::StepStarted { .. } => "STEP_STARTED",
            Self::StepFinished { .. } => "STEP_FINISHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    pub fn is_run_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::RunStarted { .. } | Self::RunFinished { .. } | Self::RunError { .. }
        )
    }

    pub fn custom(name: impl Into<String>, value: Value) -> Self {
        Self::Custom {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn events_use_screaming_type_and_camel_case_fields() {
        let event = Event::ToolCallStart {
            tool_call_id: "tc1".to_owned(),
            tool_call_name: "search".to_owned(),
            parent_message_id: None,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("serialize"),
            json!({"type":"TOOL_CALL_START","toolCallId":"tc1","toolCallName":"search"})
        );

        let parsed: Event = serde_json::from_value(json!({
            "type": "STATE_DELTA",
            "delta": [{"op":"replace","path":"/status","value":"done"}]
        }))
        .expect("parse delta");
        assert_eq!(
            parsed,
            Event::StateDelta {
                delta: vec![PatchOp::replace("/status", json!("done"))]
            }
        );
    }

    #[test]
    fn patch_op_requires_value_for_add_and_replace() {
        let missing = serde_json::from_value::<PatchOp>(json!({"op":"add","path":"/a"}));
        assert!(missing.is_err());
        let remove: PatchOp =
            serde_json::from_value(json!({"op":"remove","path":"/a"})).expect("remove");
        assert_eq!(remove.path(), "/a");
    }

    #[test]
    fn empty_tool_arguments_parse_as_empty_object() {
        let call = ToolCall {
            id: "tc1".to_owned(),
            name: "noop".to_owned(),
            arguments: String::new(),
        };
        assert_eq!(call.arguments_json().expect("args"), json!({}));
    }

    #[test]
    fn tool_messages_carry_parent_tool_call_id() {
        let message = Message::tool_result("m2", "tc1", "{\"ok\":true}");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], json!("tool"));
        assert_eq!(value["toolCallId"], json!("tc1"));
        assert!(value.get("toolCalls").is_none());
    }
}
