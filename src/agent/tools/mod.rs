use serde_json::{Value, json};

use crate::agent::EventSink;
use crate::sandbox::{DesktopSession, SandboxApi};

pub mod bash;
pub mod computer;

/// One decoded tool call, reassembled from streamed argument fragments.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    /// Client-facing tool name for a wire-level function name.
    pub fn display_name(&self) -> String {
        match self.name.as_str() {
            "computer_use" => "computer".into(),
            "bash_command" => "bash".into(),
            other => other.into(),
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Default)]
pub struct ToolOutcome {
    pub text: String,
    /// Base64 image attached to the tool result and the model history.
    pub image: Option<String>,
    /// Base64 payload for the live-preview side channel.
    pub screenshot: Option<String>,
    /// The tool already emitted its own output event.
    pub reported: bool,
}

impl ToolOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }
}

/// Perform exactly one remote operation for the given call. Unknown tool
/// names degrade to a text result instead of failing the turn.
pub async fn execute(
    call: &ToolCall,
    sandbox: &dyn SandboxApi,
    desktop: &DesktopSession,
    events: &dyn EventSink,
) -> anyhow::Result<ToolOutcome> {
    match call.name.as_str() {
        "computer_use" => computer::run(call, sandbox, desktop).await,
        "bash_command" => bash::run(call, sandbox, desktop, events).await,
        other => Ok(ToolOutcome::text(format!("Unknown tool: {other}"))),
    }
}

/// Static tool catalog advertised to the model on every round.
pub fn catalog() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "computer_use",
                "description": "Use a mouse and keyboard to interact with a computer, and take screenshots.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "action": {
                            "type": "string",
                            "enum": [
                                "screenshot", "left_click", "double_click", "right_click",
                                "mouse_move", "type", "key", "scroll", "left_click_drag", "wait"
                            ],
                            "description": "The action to perform."
                        },
                        "coordinate": {
                            "type": "array",
                            "items": { "type": "integer" },
                            "minItems": 2,
                            "maxItems": 2,
                            "description": "[X, Y] coordinates for mouse actions."
                        },
                        "to_coordinate": {
                            "type": "array",
                            "items": { "type": "integer" },
                            "minItems": 2,
                            "maxItems": 2,
                            "description": "Target [X, Y] coordinates for the drag action."
                        },
                        "text": { "type": "string", "description": "Text to type or key to press." },
                        "delta_x": { "type": "integer", "description": "Horizontal scroll delta." },
                        "delta_y": { "type": "integer", "description": "Vertical scroll delta." },
                        "duration": { "type": "integer", "description": "Seconds to wait (max 2)." }
                    },
                    "required": ["action"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "bash_command",
                "description": "Execute a bash command in the Linux terminal.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "The bash command to execute." }
                    },
                    "required": ["command"]
                }
            }
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_map_wire_names() {
        let call = |name: &str| ToolCall { id: "c".into(), name: name.into(), args: json!({}) };
        assert_eq!(call("computer_use").display_name(), "computer");
        assert_eq!(call("bash_command").display_name(), "bash");
        assert_eq!(call("browser_use").display_name(), "browser_use");
    }

    #[test]
    fn catalog_lists_both_tool_families() {
        let catalog = catalog();
        let names: Vec<&str> = catalog
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["computer_use", "bash_command"]);
    }
}
