use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentsync_protocol::{ContextItem, ToolDefinition};
use serde_json::Value;

use crate::errors::{RuntimeError, ToolError};

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Explicit run context handed to backend tools.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub thread_id: String,
    pub run_id: String,
    pub tool_call_id: String,
    pub context: Vec<ContextItem>,
    pub state: Arc<Value>,
}

/// Tool executed inside the orchestrator. Its result is fed back into the
/// same run without a client round-trip.
pub trait BackendTool: Send + Sync + 'static {
    fn definition(&self) -> ToolDefinition;
    fn call<'a>(&'a self, arguments: Value, ctx: &'a ToolContext) -> ToolFuture<'a>;
}

/// Backend tool backed by an async closure over the parsed arguments.
pub struct FnTool<F> {
    definition: ToolDefinition,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    pub fn new(definition: ToolDefinition, handler: F) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

impl<F, Fut> BackendTool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn call<'a>(&'a self, arguments: Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin((self.handler)(arguments))
    }
}

#[derive(Clone)]
pub(crate) enum ToolTarget {
    Frontend(ToolDefinition),
    Backend(ToolDefinition, Arc<dyn BackendTool>),
}

impl ToolTarget {
    pub(crate) fn definition(&self) -> &ToolDefinition {
        match self {
            Self::Frontend(definition) | Self::Backend(definition, _) => definition,
        }
    }
}

/// Backend tools registered on the orchestrator, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    backend: BTreeMap<String, (ToolDefinition, Arc<dyn BackendTool>)>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("backend", &self.backend.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Validate and add a backend tool. Name collisions are rejected here,
    /// never at call time.
    pub fn register(&mut self, tool: Arc<dyn BackendTool>) -> Result<(), RuntimeError> {
        let definition = tool.definition();
        definition.validate()?;
        if self.backend.contains_key(&definition.name) {
            return Err(RuntimeError::Registration(format!(
                "backend tool `{}` is already registered",
                definition.name
            )));
        }
        self.backend
            .insert(definition.name.clone(), (definition, tool));
        Ok(())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.backend
            .values()
            .map(|(definition, _)| definition.clone())
            .collect()
    }

    /// Union of backend tools and one request's frontend tools.
    /// Complexity: O((b + f) log(b + f)).
    pub(crate) fn resolve(&self, frontend: &[ToolDefinition]) -> Result<ToolSet, RuntimeError> {
        let mut targets: BTreeMap<String, ToolTarget> = self
            .backend
            .iter()
            .map(|(name, (definition, tool))| {
                (
                    name.clone(),
                    ToolTarget::Backend(definition.clone(), Arc::clone(tool)),
                )
            })
            .collect();
        for definition in frontend {
            definition.validate()?;
            if let Some(existing) = targets.get(&definition.name) {
                let owner = match existing {
                    ToolTarget::Frontend(_) => "another frontend tool",
                    ToolTarget::Backend(..) => "a backend tool",
                };
                return Err(RuntimeError::Registration(format!(
                    "frontend tool `{}` collides with {owner}",
                    definition.name
                )));
            }
            targets.insert(
                definition.name.clone(),
                ToolTarget::Frontend(definition.clone()),
            );
        }
        Ok(ToolSet { targets })
    }
}

/// Tools invocable by one run.
#[derive(Clone, Default)]
pub(crate) struct ToolSet {
    targets: BTreeMap<String, ToolTarget>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolSet {
    pub(crate) fn get(&self, name: &str) -> Option<&ToolTarget> {
        self.targets.get(name)
    }

    pub(crate) fn definitions(&self) -> Vec<ToolDefinition> {
        self.targets
            .values()
            .map(|target| target.definition().clone())
            .collect()
    }
}
