use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use super::{ToolCall, ToolOutcome};
use crate::agent::EventSink;
use crate::protocol::{StreamEvent, ToolOutput};
use crate::sandbox::{DesktopSession, SandboxApi};

pub const EMPTY_OUTPUT: &str = "(Command executed successfully with no output)";

/// Run one shell command remotely. The result is plain text, so this tool
/// emits its own tool-output event and suppresses the generic one.
pub async fn run(
    call: &ToolCall,
    sandbox: &dyn SandboxApi,
    desktop: &DesktopSession,
    events: &dyn EventSink,
) -> anyhow::Result<ToolOutcome> {
    let Some(command) = call.args.get("command").and_then(Value::as_str) else {
        return Ok(ToolOutcome::text("Unknown action: missing command"));
    };

    let result = sandbox.exec(&desktop.id, command).await?;
    let output = select_output(decode(result.stdout_b64), decode(result.stderr_b64));

    events.emit(StreamEvent::ToolOutputAvailable {
        tool_call_id: call.id.clone(),
        output: ToolOutput::Text { text: output.clone() },
    });

    Ok(ToolOutcome { text: output, reported: true, ..Default::default() })
}

fn decode(b64: Option<String>) -> String {
    b64.and_then(|value| BASE64.decode(value).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Prefer stdout, fall back to stderr, fall back to a fixed placeholder.
fn select_output(stdout: String, stderr: String) -> String {
    if !stdout.is_empty() {
        stdout
    } else if !stderr.is_empty() {
        stderr
    } else {
        EMPTY_OUTPUT.to_string()
    }
}
