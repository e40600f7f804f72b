use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ToolSchemaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParameterKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Invocable tool descriptor, declared by the frontend or the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Registration-time checks: name charset and unique parameter names.
    /// Complexity: O(p), p = parameter count.
    pub fn validate(&self) -> Result<(), ToolSchemaError> {
        if self.name.is_empty() {
            return Err(ToolSchemaError::EmptyName);
        }
        let valid_name = self
            .name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid_name {
            return Err(ToolSchemaError::InvalidName(self.name.clone()));
        }

        let mut seen = HashSet::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            if parameter.name.is_empty() {
                return Err(ToolSchemaError::EmptyParameterName {
                    tool: self.name.clone(),
                });
            }
            if !seen.insert(parameter.name.as_str()) {
                return Err(ToolSchemaError::DuplicateParameter {
                    tool: self.name.clone(),
                    parameter: parameter.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Describe argument problems: missing required parameters and
    /// present parameters of the wrong kind. Empty means acceptable.
    pub fn argument_problems(&self, arguments: &Value) -> Vec<String> {
        let Some(object) = arguments.as_object() else {
            return vec!["arguments must be a JSON object".to_owned()];
        };
        let mut problems = Vec::new();
        for parameter in &self.parameters {
            match object.get(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    problems.push(format!("missing required parameter `{}`", parameter.name));
                }
                Some(value) if !value.is_null() && !parameter.kind.matches(value) => {
                    problems.push(format!(
                        "parameter `{}` expected {:?}",
                        parameter.name, parameter.kind
                    ));
                }
                _ => {}
            }
        }
        problems
    }
}
