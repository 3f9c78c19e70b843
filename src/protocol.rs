use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One transcript entry. A "tool-bearing" message is an assistant message
/// whose `parts` holds a single tool-invocation part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user(id: String, content: String) -> Self {
        Self { id, role: Role::User, content, parts: Vec::new() }
    }

    pub fn assistant(id: String, content: String) -> Self {
        Self { id, role: Role::Assistant, content, parts: Vec::new() }
    }

    pub fn tool(id: String, invocation: ToolInvocation) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            parts: vec![Part::ToolInvocation { tool_invocation: invocation }],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
}

/// A structured request by the model to perform one remote action, tracked
/// through its call and result states.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub state: InvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutput>,
}

/// `Call` precedes `Result`; `Streaming` is reserved for in-progress argument
/// accumulation. Variant order matters: the dispatcher never downgrades.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Streaming,
    Call,
    Result,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolOutput {
    Text { text: String },
    Image { data: String },
}

/// Server-to-client protocol events. Unknown tags decode to `Unknown` and are
/// dropped by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    TextDelta {
        #[serde(alias = "textDelta")]
        delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: ToolOutput,
    },
    ScreenshotUpdate {
        screenshot: String,
    },
    Finish,
    Error {
        error_text: String,
    },
    #[serde(other)]
    Unknown,
}

/// Client-to-server messages. The single shape today is `chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Chat {
        messages: Vec<Message>,
        timestamp: i64,
        sandbox_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}
