use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::RuntimeError;
use crate::sink::EventListener;

pub const RUN_TIMEOUT_ENV: &str = "AGENTSYNC_RUN_TIMEOUT_MS";
pub const TOOL_TIMEOUT_ENV: &str = "AGENTSYNC_TOOL_TIMEOUT_MS";
pub const MAX_STEPS_ENV: &str = "AGENTSYNC_MAX_STEPS";

pub const DEFAULT_AGENT_NAME: &str = "default";

/// Bounds for the run's suspension points. `None` waits indefinitely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunTimeouts {
    /// Gap between two adapter stream items.
    pub adapter_chunk: Option<Duration>,
    /// Wait for `respond(tool_call_id, ..)` on a frontend tool.
    pub frontend_tool: Option<Duration>,
    /// Execution of one backend tool.
    pub backend_tool: Option<Duration>,
    /// Wait for `resume(..)` after an interrupt.
    pub resume: Option<Duration>,
    /// Whole run, measured from dispatch.
    pub run: Option<Duration>,
}

impl RunTimeouts {
    pub fn with_adapter_chunk(mut self, timeout: Duration) -> Self {
        self.adapter_chunk = Some(timeout);
        self
    }

    pub fn with_frontend_tool(mut self, timeout: Duration) -> Self {
        self.frontend_tool = Some(timeout);
        self
    }

    pub fn with_backend_tool(mut self, timeout: Duration) -> Self {
        self.backend_tool = Some(timeout);
        self
    }

    pub fn with_resume(mut self, timeout: Duration) -> Self {
        self.resume = Some(timeout);
        self
    }

    pub fn with_run(mut self, timeout: Duration) -> Self {
        self.run = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct RuntimeConfig {
    pub timeouts: RunTimeouts,
    /// Adapter invocations allowed per run (tool round-trips included).
    pub max_steps: u32,
    /// Per-run subscriber stream capacity. A full stream applies backpressure.
    pub run_channel_capacity: usize,
    /// Live broadcast ring capacity. Slow live subscribers lag and skip.
    pub live_channel_capacity: usize,
    /// Queue depth in front of registered listeners. Overflow is dropped.
    pub listener_channel_capacity: usize,
    pub state_update_capacity: usize,
    /// State key used for runs that name no agent.
    pub default_agent_name: String,
    pub listeners: Vec<Arc<dyn EventListener>>,
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("timeouts", &self.timeouts)
            .field("max_steps", &self.max_steps)
            .field("run_channel_capacity", &self.run_channel_capacity)
            .field("live_channel_capacity", &self.live_channel_capacity)
            .field("listener_channel_capacity", &self.listener_channel_capacity)
            .field("state_update_capacity", &self.state_update_capacity)
            .field("default_agent_name", &self.default_agent_name)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeouts: RunTimeouts::default(),
            max_steps: 16,
            run_channel_capacity: 256,
            live_channel_capacity: 1024,
            listener_channel_capacity: 1024,
            state_update_capacity: 256,
            default_agent_name: DEFAULT_AGENT_NAME.to_owned(),
            listeners: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with `AGENTSYNC_*` environment overrides applied.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeError> {
        if let Some(ms) = read_u64(&lookup, RUN_TIMEOUT_ENV)? {
            self.timeouts.run = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = read_u64(&lookup, TOOL_TIMEOUT_ENV)? {
            self.timeouts.frontend_tool = Some(Duration::from_millis(ms));
            self.timeouts.backend_tool = Some(Duration::from_millis(ms));
        }
        if let Some(steps) = read_u64(&lookup, MAX_STEPS_ENV)? {
            self.max_steps = u32::try_from(steps).map_err(|_| {
                RuntimeError::InvalidConfig(format!("{MAX_STEPS_ENV} is out of range"))
            })?;
        }
        Ok(self)
    }

    pub fn with_timeouts(mut self, timeouts: RunTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_default_agent_name(mut self, name: impl Into<String>) -> Self {
        self.default_agent_name = name.into();
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_steps == 0 {
            return Err(invalid("max_steps must be > 0"));
        }
        if self.run_channel_capacity == 0 {
            return Err(invalid("run_channel_capacity must be > 0"));
        }
        if self.live_channel_capacity == 0 {
            return Err(invalid("live_channel_capacity must be > 0"));
        }
        if self.listener_channel_capacity == 0 {
            return Err(invalid("listener_channel_capacity must be > 0"));
        }
        if self.state_update_capacity == 0 {
            return Err(invalid("state_update_capacity must be > 0"));
        }
        if self.default_agent_name.trim().is_empty() {
            return Err(invalid("default_agent_name must not be empty"));
        }
        let timeouts = [
            ("adapter_chunk", self.timeouts.adapter_chunk),
            ("frontend_tool", self.timeouts.frontend_tool),
            ("backend_tool", self.timeouts.backend_tool),
            ("resume", self.timeouts.resume),
            ("run", self.timeouts.run),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_some_and(|value| value.is_zero()) {
                return Err(RuntimeError::InvalidConfig(format!(
                    "{name} timeout must be > 0"
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> RuntimeError {
    RuntimeError::InvalidConfig(message.to_owned())
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, RuntimeError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|err| RuntimeError::InvalidConfig(format!("{key}={trimmed}: {err}")))
}
