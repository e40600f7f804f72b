use std::collections::{BTreeSet, HashSet};

use crate::errors::ProtocolError;
use crate::event::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    /// Whole run: RUN_STARTED first, exactly one terminal event.
    Run,
    /// One adapter step: run lifecycle events are optional.
    Step,
}

/// Incremental checker for the event stream contract.
/// Feed events in arrival order with `observe`; call `finish` at stream end.
#[derive(Debug)]
pub struct StreamValidator {
    scope: Scope,
    started: bool,
    terminated: bool,
    open_messages: BTreeSet<String>,
    seen_messages: HashSet<String>,
    open_tool_calls: BTreeSet<String>,
    seen_tool_calls: HashSet<String>,
    open_steps: BTreeSet<String>,
}

impl StreamValidator {
    pub fn run() -> Self {
        Self::with_scope(Scope::Run)
    }

    /// Validator for an adapter's step output, where RUN_STARTED and the
    /// terminal event may be absent.
    pub fn step() -> Self {
        Self::with_scope(Scope::Step)
    }

    fn with_scope(scope: Scope) -> Self {
        Self {
            scope,
            started: false,
            terminated: false,
            open_messages: BTreeSet::new(),
            seen_messages: HashSet::new(),
            open_tool_calls: BTreeSet::new(),
            seen_tool_calls: HashSet::new(),
            open_steps: BTreeSet::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn open_message_ids(&self) -> impl Iterator<Item = &str> {
        self.open_messages.iter().map(String::as_str)
    }

    pub fn open_tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.open_tool_calls.iter().map(String::as_str)
    }

    /// Check one event against the stream so far. On error the validator
    /// state is unchanged.
    /// Complexity: O(log k), k = open ids.
    pub fn observe(&mut self, event: &Event) -> Result<(), ProtocolError> {
        let name = event.name();
        if self.terminated {
            return Err(ProtocolError::AfterTerminal {
                event: name.to_owned(),
            });
        }
        if let Event::RunStarted { .. } = event {
            if self.started {
                return Err(ProtocolError::DuplicateRunStarted);
            }
            self.started = true;
            return Ok(());
        }
        if !self.started && self.scope == Scope::Run {
            return Err(ProtocolError::NotStarted {
                event: name.to_owned(),
            });
        }
        self.apply(event, name)?;
        // RUN_STARTED is only accepted as the first event of a step stream.
        self.started = true;
        Ok(())
    }

    fn apply(&mut self, event: &Event, name: &str) -> Result<(), ProtocolError> {
        match event {
            Event::RunStarted { .. } => {}
            Event::RunFinished { .. } => {
                self.ensure_closed(name)?;
                self.terminated = true;
            }
            // Errors may interrupt open messages; their partial content is discarded.
            Event::RunError { .. } => self.terminated = true,
            Event::TextMessageStart { message_id, .. } => {
                open(
                    &mut self.open_messages,
                    &mut self.seen_messages,
                    "message",
                    message_id,
                )?;
            }
            Event::TextMessageContent { message_id, .. } => {
                require_open(&self.open_messages, name, message_id)?;
            }
            Event::TextMessageEnd { message_id } => {
                require_open(&self.open_messages, name, message_id)?;
                self.open_messages.remove(message_id);
            }
            Event::ToolCallStart { tool_call_id, .. } => {
                open(
                    &mut self.open_tool_calls,
                    &mut self.seen_tool_calls,
                    "tool call",
                    tool_call_id,
                )?;
            }
            Event::ToolCallArgs { tool_call_id, .. } => {
                require_open(&self.open_tool_calls, name, tool_call_id)?;
            }
            Event::ToolCallEnd { tool_call_id } => {
                require_open(&self.open_tool_calls, name, tool_call_id)?;
                self.open_tool_calls.remove(tool_call_id);
            }
            Event::StepStarted { step_name } => {
                if !self.open_steps.insert(step_name.clone()) {
                    return Err(ProtocolError::DuplicateStep {
                        step: step_name.clone(),
                    });
                }
            }
            Event::StepFinished { step_name } => {
                if !self.open_steps.remove(step_name) {
                    return Err(ProtocolError::StepNotOpen {
                        step: step_name.clone(),
                    });
                }
            }
            Event::StateSnapshot { .. }
            | Event::StateDelta { .. }
            | Event::MessagesSnapshot { .. }
            | Event::Custom { .. }
            | Event::Raw { .. } => {}
        }
        Ok(())
    }

    /// Check end-of-stream conditions.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.scope == Scope::Run && !self.terminated {
            return Err(ProtocolError::MissingTerminal);
        }
        if self.terminated {
            // RUN_FINISHED already checked closure; RUN_ERROR tolerates open ids.
            return Ok(());
        }
        self.ensure_closed("end of stream")
    }

    fn ensure_closed(&self, at: &str) -> Result<(), ProtocolError> {
        if !self.open_messages.is_empty() {
            return Err(ProtocolError::Unclosed {
                kind: "message".to_owned(),
                at: at.to_owned(),
                ids: self.open_messages.iter().cloned().collect(),
            });
        }
        if !self.open_tool_calls.is_empty() {
            return Err(ProtocolError::Unclosed {
                kind: "tool call".to_owned(),
                at: at.to_owned(),
                ids: self.open_tool_calls.iter().cloned().collect(),
            });
        }
        if !self.open_steps.is_empty() {
            return Err(ProtocolError::Unclosed {
                kind: "step".to_owned(),
                at: at.to_owned(),
                ids: self.open_steps.iter().cloned().collect(),
            });
        }
        Ok(())
    }
}

fn open(
    open: &mut BTreeSet<String>,
    seen: &mut HashSet<String>,
    kind: &str,
    id: &str,
) -> Result<(), ProtocolError> {
    if seen.contains(id) {
        return Err(ProtocolError::DuplicateId {
            kind: kind.to_owned(),
            id: id.to_owned(),
        });
    }
    seen.insert(id.to_owned());
    open.insert(id.to_owned());
    Ok(())
}

fn require_open(open: &BTreeSet<String>, event: &str, id: &str) -> Result<(), ProtocolError> {
    if open.contains(id) {
        Ok(())
    } else {
        Err(ProtocolError::NotOpen {
            event: event.to_owned(),
            id: id.to_owned(),
        })
    }
}
