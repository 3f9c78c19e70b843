use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::{ToolCall, ToolOutcome};
use crate::sandbox::{DesktopSession, MouseButton, SandboxApi};

pub const SCREEN_WIDTH: u32 = 1024;
pub const SCREEN_HEIGHT: u32 = 768;

const MAX_WAIT_SECS: u64 = 2;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    Screenshot,
    LeftClick {
        coordinate: (i64, i64),
    },
    DoubleClick {
        coordinate: (i64, i64),
    },
    RightClick {
        coordinate: (i64, i64),
    },
    MouseMove {
        coordinate: (i64, i64),
    },
    Type {
        text: String,
    },
    Key {
        text: String,
    },
    Scroll {
        #[serde(default)]
        delta_x: i64,
        #[serde(default)]
        delta_y: i64,
    },
    LeftClickDrag {
        coordinate: (i64, i64),
        to_coordinate: (i64, i64),
    },
    Wait {
        #[serde(default = "default_wait")]
        duration: u64,
    },
}

fn default_wait() -> u64 {
    1
}

/// Malformed or unrecognized action payloads degrade to a text result
/// carrying the offending action name.
fn decode_action(args: &Value) -> Result<Action, String> {
    serde_json::from_value(args.clone()).map_err(|_| {
        args.get("action")
            .and_then(Value::as_str)
            .unwrap_or("(none)")
            .to_string()
    })
}

pub async fn run(
    call: &ToolCall,
    sandbox: &dyn SandboxApi,
    desktop: &DesktopSession,
) -> anyhow::Result<ToolOutcome> {
    let action = match decode_action(&call.args) {
        Ok(action) => action,
        Err(name) => return Ok(ToolOutcome::text(format!("Unknown action: {name}"))),
    };

    let outcome = match action {
        Action::Screenshot => {
            let png = sandbox.screenshot(&desktop.id).await?;
            let encoded = BASE64.encode(&png);
            let text = format!(
                "Screenshot taken at {}\nScreen: {SCREEN_WIDTH}x{SCREEN_HEIGHT} pixels, origin (0,0) at top-left, Y increases downward",
                Utc::now().to_rfc3339(),
            );
            ToolOutcome {
                text,
                image: Some(encoded.clone()),
                screenshot: Some(encoded),
                reported: false,
            }
        }
        Action::LeftClick { coordinate: (x, y) } => {
            sandbox.click_mouse(&desktop.id, x, y, MouseButton::Left, 1).await?;
            ToolOutcome::text(format!("Left clicked at coordinates ({x}, {y})"))
        }
        Action::DoubleClick { coordinate: (x, y) } => {
            sandbox.click_mouse(&desktop.id, x, y, MouseButton::Left, 2).await?;
            ToolOutcome::text(format!("Double clicked at coordinates ({x}, {y})"))
        }
        Action::RightClick { coordinate: (x, y) } => {
            sandbox.click_mouse(&desktop.id, x, y, MouseButton::Right, 1).await?;
            ToolOutcome::text(format!("Right clicked at coordinates ({x}, {y})"))
        }
        Action::MouseMove { coordinate: (x, y) } => {
            sandbox.move_mouse(&desktop.id, x, y).await?;
            ToolOutcome::text(format!("Moved mouse to {x}, {y}"))
        }
        Action::Type { text } => {
            sandbox.type_text(&desktop.id, &text).await?;
            ToolOutcome::text(format!("Typed: {text}"))
        }
        Action::Key { text } => {
            let key = normalize_key(&text);
            sandbox.press_key(&desktop.id, &key).await?;
            ToolOutcome::text(format!("Pressed key: {key}"))
        }
        Action::Scroll { delta_x, delta_y } => {
            sandbox.scroll(&desktop.id, delta_x, delta_y).await?;
            ToolOutcome::text(format!("Scrolled by delta ({delta_x}, {delta_y})"))
        }
        Action::LeftClickDrag { coordinate, to_coordinate } => {
            sandbox.drag_mouse(&desktop.id, coordinate, to_coordinate).await?;
            ToolOutcome::text(format!(
                "Dragged mouse from ({}, {}) to ({}, {})",
                coordinate.0, coordinate.1, to_coordinate.0, to_coordinate.1
            ))
        }
        Action::Wait { duration } => {
            let secs = duration.min(MAX_WAIT_SECS);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            ToolOutcome::text(format!("Waited for {secs} seconds"))
        }
    };
    Ok(outcome)
}

/// Map common symbolic key names onto the X keysym names the sandbox expects.
fn normalize_key(key: &str) -> String {
    match key.to_lowercase().as_str() {
        "enter" => "Return",
        "tab" => "Tab",
        "backspace" => "BackSpace",
        "escape" | "esc" => "Escape",
        "space" => "space",
        "up" => "Up",
        "down" => "Down",
        "left" => "Left",
        "right" => "Right",
        _ => return key.to_string(),
    }
    .to_string()
}
