use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::{InvocationState, Message, Part, StreamEvent, ToolInvocation, ToolOutput};
use crate::session::{SessionStore, Status};

/// Host callback for turn-fatal stream errors.
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Applies inbound protocol events to the session store, one at a time, in
/// arrival order. Holds the small cross-event correlation state: the message
/// currently open for text accumulation, the toolCallId -> messageId map, and
/// the tool call currently eligible for out-of-band screenshots.
pub struct Dispatcher {
    current_text_id: Option<String>,
    tool_messages: HashMap<String, String>,
    active_screenshot_tool: Option<String>,
    on_error: Option<ErrorCallback>,
}

impl Dispatcher {
    pub fn new(on_error: Option<ErrorCallback>) -> Self {
        Self {
            current_text_id: None,
            tool_messages: HashMap::new(),
            active_screenshot_tool: None,
            on_error,
        }
    }

    /// Forget the open text message and screenshot source. Called when a new
    /// user message is submitted.
    pub fn reset_turn(&mut self) {
        self.current_text_id = None;
        self.active_screenshot_tool = None;
    }

    pub fn apply(&mut self, store: &SessionStore, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta } => {
                if delta.is_empty() {
                    return;
                }
                self.text_delta(store, delta);
            }
            StreamEvent::ToolInputAvailable { tool_call_id, tool_name, input } => {
                let args_text = serde_json::to_string_pretty(&input).ok();
                let is_screenshot =
                    input.get("action").and_then(Value::as_str) == Some("screenshot");
                self.upsert_tool(store, &tool_call_id, |inv| {
                    inv.tool_name = Some(tool_name.clone());
                    inv.args = Some(input.clone());
                    inv.args_text = args_text.clone();
                    inv.state = inv.state.max(InvocationState::Call);
                });
                if is_screenshot {
                    self.active_screenshot_tool = Some(tool_call_id);
                }
            }
            StreamEvent::ToolOutputAvailable { tool_call_id, output } => {
                let is_image = matches!(output, ToolOutput::Image { .. });
                self.upsert_tool(store, &tool_call_id, |inv| {
                    inv.result = Some(output.clone());
                    inv.state = inv.state.max(InvocationState::Result);
                });
                if is_image {
                    self.active_screenshot_tool = Some(tool_call_id);
                }
            }
            StreamEvent::ScreenshotUpdate { screenshot } => {
                if screenshot.is_empty() {
                    return;
                }
                let Some(tool_call_id) = self.active_screenshot_tool.clone() else {
                    return;
                };
                // Attach the payload without touching the invocation state.
                self.update_tool(store, &tool_call_id, |inv| {
                    inv.result = Some(ToolOutput::Image { data: screenshot.clone() });
                });
            }
            StreamEvent::Finish => {
                self.current_text_id = None;
                store.update(|s| s.status = Status::Ready);
            }
            StreamEvent::Error { error_text } => {
                let text = if error_text.is_empty() {
                    "Streaming error".to_string()
                } else {
                    error_text
                };
                if let Some(cb) = &self.on_error {
                    cb(text);
                }
                store.update(|s| s.status = Status::Ready);
            }
            StreamEvent::Unknown => warn!("dropping event with unknown tag"),
        }
    }

    fn text_delta(&mut self, store: &SessionStore, delta: String) {
        match self.current_text_id.clone() {
            None => {
                let id = format!("assistant-{}", Uuid::new_v4());
                self.current_text_id = Some(id.clone());
                store.update(move |s| s.messages.push(Message::assistant(id, delta)));
            }
            Some(open_id) => store.update(move |s| {
                if let Some(m) = s.messages.iter_mut().find(|m| m.id == open_id) {
                    m.content.push_str(&delta);
                }
            }),
        }
    }

    /// Resolve or create the message carrying this tool invocation, then apply
    /// the mutation. First occurrence of a toolCallId creates a new assistant
    /// message and closes any open text message.
    fn upsert_tool(
        &mut self,
        store: &SessionStore,
        tool_call_id: &str,
        apply: impl Fn(&mut ToolInvocation),
    ) {
        if self.tool_messages.contains_key(tool_call_id) {
            self.update_tool(store, tool_call_id, apply);
            return;
        }

        let message_id = format!("tool-{tool_call_id}");
        self.tool_messages.insert(tool_call_id.to_string(), message_id.clone());
        let mut invocation = ToolInvocation {
            tool_call_id: tool_call_id.to_string(),
            tool_name: None,
            state: InvocationState::Streaming,
            args: None,
            args_text: None,
            result: None,
        };
        apply(&mut invocation);
        self.current_text_id = None;
        store.update(move |s| s.messages.push(Message::tool(message_id, invocation)));
    }

    fn update_tool(
        &self,
        store: &SessionStore,
        tool_call_id: &str,
        apply: impl Fn(&mut ToolInvocation),
    ) {
        let Some(message_id) = self.tool_messages.get(tool_call_id).cloned() else {
            return;
        };
        let tool_call_id = tool_call_id.to_string();
        store.update(move |s| {
            let Some(message) = s.messages.iter_mut().find(|m| m.id == message_id) else {
                return;
            };
            for part in &mut message.parts {
                if let Part::ToolInvocation { tool_invocation } = part {
                    if tool_invocation.tool_call_id == tool_call_id {
                        apply(tool_invocation);
                    }
                }
            }
        });
    }
}
