use std::collections::HashMap;

use agentsync_protocol::{Event, Message, Role, ToolCall};

/// Builds finalized messages out of streamed message and tool-call events.
///
/// Content is concatenated in arrival order. Only messages and tool calls
/// whose END has been seen leave the assembler; open ones are discarded
/// with it.
#[derive(Debug, Default)]
pub(crate) struct MessageAssembler {
    open_messages: HashMap<String, Message>,
    open_tool_calls: HashMap<String, (ToolCall, Option<String>)>,
    finalized: Vec<Message>,
    finalized_tool_calls: Vec<(ToolCall, Option<String>)>,
}

/// Output of one flush: messages to persist, in END order, and the tool
/// calls to resolve, in END order.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Finalized {
    pub(crate) messages: Vec<Message>,
    pub(crate) tool_calls: Vec<ToolCall>,
}

impl MessageAssembler {
    /// Complexity: O(d), d = delta length.
    pub(crate) fn observe(&mut self, event: &Event) {
        match event {
            Event::TextMessageStart { message_id, role } => {
                self.open_messages
                    .insert(message_id.clone(), Message::new(message_id, *role, ""));
            }
            Event::TextMessageContent { message_id, delta } => {
                if let Some(message) = self.open_messages.get_mut(message_id) {
                    message.content.push_str(delta);
                }
            }
            Event::TextMessageEnd { message_id } => {
                if let Some(message) = self.open_messages.remove(message_id) {
                    self.finalized.push(message);
                }
            }
            Event::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id,
            } => {
                self.open_tool_calls.insert(
                    tool_call_id.clone(),
                    (
                        ToolCall {
                            id: tool_call_id.clone(),
                            name: tool_call_name.clone(),
                            arguments: String::new(),
                        },
                        parent_message_id.clone(),
                    ),
                );
            }
            Event::ToolCallArgs {
                tool_call_id,
                delta,
            } => {
                if let Some((call, _)) = self.open_tool_calls.get_mut(tool_call_id) {
                    call.arguments.push_str(delta);
                }
            }
            Event::ToolCallEnd { tool_call_id } => {
                if let Some(entry) = self.open_tool_calls.remove(tool_call_id) {
                    self.finalized_tool_calls.push(entry);
                }
            }
            _ => {}
        }
    }

    /// Take everything finalized so far. Tool calls attach to their parent
    /// message when it is finalized in the same flush; the rest go on one
    /// synthetic assistant message with id `orphan_message_id`.
    pub(crate) fn take_finalized(
        &mut self,
        orphan_message_id: impl FnOnce() -> String,
    ) -> Finalized {
        let mut messages = std::mem::take(&mut self.finalized);
        let entries = std::mem::take(&mut self.finalized_tool_calls);
        let mut tool_calls = Vec::with_capacity(entries.len());
        let mut orphans = Vec::new();

        for (call, parent) in entries {
            tool_calls.push(call.clone());
            let parent_message = match parent.as_deref() {
                Some(parent_id) => messages
                    .iter_mut()
                    .find(|message| message.id == parent_id && message.role == Role::Assistant),
                None => None,
            };
            match parent_message {
                Some(message) => message.tool_calls.push(call),
                None => orphans.push(call),
            }
        }

        if !orphans.is_empty() {
            let mut carrier = Message::assistant(orphan_message_id(), "");
            carrier.tool_calls = orphans;
            messages.push(carrier);
        }
        Finalized {
            messages,
            tool_calls,
        }
    }

    /// Drop unfinished messages and tool calls. Returns how many were dropped.
    pub(crate) fn discard_open(&mut self) -> usize {
        let dropped = self.open_messages.len() + self.open_tool_calls.len();
        self.open_messages.clear();
        self.open_tool_calls.clear();
        dropped
    }
}
