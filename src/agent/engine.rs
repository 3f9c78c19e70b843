use std::collections::BTreeMap;

use anyhow::Context as _;
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::EventSink;
use crate::agent::tools::{self, ToolCall, ToolOutcome};
use crate::models::{CompletionEvent, CompletionRequest, LanguageModel};
use crate::protocol::{Message, Role, StreamEvent, ToolOutput};
use crate::sandbox::{DesktopSession, SandboxApi};
use crate::settings::ModelSettings;

/// Hard bound on model-completion rounds per turn.
pub const MAX_ROUNDS: usize = 100;

const SYSTEM_PROMPT: &str = "You are an operator agent controlling a remote Linux desktop \
(1024x768, origin at the top-left, Y increasing downward). Narrate what you are doing for \
the user, verify the screen state with a screenshot after acting, and never guess \
coordinates you have not seen.";

pub struct TurnContext<'a> {
    pub model: &'a dyn LanguageModel,
    pub sandbox: &'a dyn SandboxApi,
    pub desktop: &'a DesktopSession,
    pub events: &'a dyn EventSink,
    /// Effective model settings for this turn (request override applied).
    pub settings: &'a ModelSettings,
}

/// In-progress reassembly of one streamed tool call, keyed by its declared
/// index. Argument fragments concatenate in arrival order and are parsed
/// once, after the stream ends.
#[derive(Debug, Default)]
struct ToolCallDraft {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallDraft {
    fn absorb(&mut self, id: Option<String>, name: Option<String>, arguments: String) {
        if self.id.is_none() {
            self.id = id;
        }
        if self.name.is_empty() {
            if let Some(name) = name {
                self.name = name;
            }
        }
        self.arguments.push_str(&arguments);
    }

    fn finish(self) -> anyhow::Result<(ToolCall, String)> {
        let raw = self.arguments;
        let args: Value = if raw.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&raw).context("tool call arguments were not valid JSON")?
        };
        let call = ToolCall {
            id: self.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            name: self.name,
            args,
        };
        Ok((call, raw))
    }
}

/// Drive one chat turn: up to [`MAX_ROUNDS`] generate rounds, each optionally
/// followed by a single tool dispatch. Every successful turn ends with one
/// `finish` event, including round-cap exhaustion, so the client is never
/// left streaming forever.
pub async fn run_turn(ctx: &TurnContext<'_>, transcript: &[Message]) -> anyhow::Result<()> {
    let mut history = build_history(transcript);
    let catalog = tools::catalog();

    for round in 1..=MAX_ROUNDS {
        counter!("operator_rounds_total").increment(1);
        let mut stream = ctx
            .model
            .stream_chat(CompletionRequest {
                model: &ctx.settings.model,
                messages: &history,
                tools: &catalog,
                temperature: ctx.settings.temperature,
                max_tokens: ctx.settings.max_tokens,
            })
            .await?;

        let mut full_text = String::new();
        let mut drafts: BTreeMap<u64, ToolCallDraft> = BTreeMap::new();
        while let Some(event) = stream.next().await {
            match event? {
                CompletionEvent::TextDelta(delta) => {
                    full_text.push_str(&delta);
                    ctx.events.emit(StreamEvent::TextDelta { delta });
                }
                CompletionEvent::ToolCallDelta { index, id, name, arguments } => {
                    drafts.entry(index).or_default().absorb(id, name, arguments);
                }
                CompletionEvent::Completed => break,
            }
        }

        // Single-tool-per-round policy: only the call with the lowest index
        // is surfaced and executed, however many the model streamed.
        let Some((_, draft)) = drafts.into_iter().next() else {
            if !full_text.is_empty() {
                history.push(json!({ "role": "assistant", "content": full_text }));
            }
            ctx.events.emit(StreamEvent::Finish);
            debug!(round, "turn finished");
            return Ok(());
        };

        let (call, raw_args) = draft.finish()?;
        history.push(json!({
            "role": "assistant",
            "content": if full_text.is_empty() { Value::Null } else { Value::String(full_text.clone()) },
            "tool_calls": [{
                "id": call.id,
                "type": "function",
                "function": { "name": call.name, "arguments": raw_args },
            }],
        }));

        ctx.events.emit(StreamEvent::ToolInputAvailable {
            tool_call_id: call.id.clone(),
            tool_name: call.display_name(),
            input: call.args.clone(),
        });

        counter!("operator_tool_executions_total").increment(1);
        let outcome = tools::execute(&call, ctx.sandbox, ctx.desktop, ctx.events).await?;
        if !outcome.reported {
            let output = match &outcome.image {
                Some(data) => ToolOutput::Image { data: data.clone() },
                None => ToolOutput::Text { text: outcome.text.clone() },
            };
            ctx.events.emit(StreamEvent::ToolOutputAvailable {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        if let Some(screenshot) = &outcome.screenshot {
            ctx.events.emit(StreamEvent::ScreenshotUpdate { screenshot: screenshot.clone() });
        }
        history.push(tool_history_entry(&call.id, &outcome));
    }

    warn!(max_rounds = MAX_ROUNDS, "turn stopped at the round cap");
    ctx.events.emit(StreamEvent::Finish);
    Ok(())
}

fn build_history(transcript: &[Message]) -> Vec<Value> {
    let mut history = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
    for message in transcript {
        // Tool-bearing entries replay with empty content; skip them.
        if message.content.is_empty() {
            continue;
        }
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        history.push(json!({ "role": role, "content": message.content }));
    }
    history
}

fn tool_history_entry(call_id: &str, outcome: &ToolOutcome) -> Value {
    match &outcome.image {
        Some(image) => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": [
                { "type": "text", "text": outcome.text },
                { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{image}") } },
            ],
        }),
        None => json!({ "role": "tool", "tool_call_id": call_id, "content": outcome.text }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompletionStream;
    use crate::sandbox::{ExecOutput, MouseButton};
    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CollectingSink(Mutex<Vec<StreamEvent>>);

    impl CollectingSink {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }

        fn events(&self) -> Vec<StreamEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl EventSink for CollectingSink {
        fn emit(&self, event: StreamEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Replays one canned event script per round; repeats the last script
    /// when the rounds outnumber the scripts.
    struct ScriptedModel {
        scripts: Vec<Vec<CompletionEvent>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(scripts: Vec<Vec<CompletionEvent>>) -> Self {
            Self { scripts, calls: AtomicUsize::new(0) }
        }

        fn rounds(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_chat(
            &self,
            _req: CompletionRequest<'_>,
        ) -> anyhow::Result<CompletionStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.get(call).or_else(|| self.scripts.last()).unwrap();
            Ok(CompletionStream::from_events(script.clone()))
        }
    }

    #[derive(Default)]
    struct CountingSandbox {
        screenshots: AtomicUsize,
        clicks: AtomicUsize,
        moves: AtomicUsize,
        execs: AtomicUsize,
    }

    #[async_trait]
    impl SandboxApi for CountingSandbox {
        async fn acquire(&self, _existing: Option<&str>) -> anyhow::Result<DesktopSession> {
            Ok(DesktopSession { id: "desk-test".into(), stream_url: "https://view".into() })
        }

        async fn release(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn screenshot(&self, _id: &str) -> anyhow::Result<Vec<u8>> {
            self.screenshots.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0x89, b'P', b'N', b'G'])
        }

        async fn click_mouse(
            &self,
            _id: &str,
            _x: i64,
            _y: i64,
            _button: MouseButton,
            _clicks: u32,
        ) -> anyhow::Result<()> {
            self.clicks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn move_mouse(&self, _id: &str, _x: i64, _y: i64) -> anyhow::Result<()> {
            self.moves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn drag_mouse(
            &self,
            _id: &str,
            _from: (i64, i64),
            _to: (i64, i64),
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn type_text(&self, _id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn press_key(&self, _id: &str, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn scroll(&self, _id: &str, _dx: i64, _dy: i64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn exec(&self, _id: &str, _command: &str) -> anyhow::Result<ExecOutput> {
            self.execs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutput { stdout_b64: Some("aGVsbG8K".into()), stderr_b64: None })
        }
    }

    fn test_settings() -> ModelSettings {
        ModelSettings {
            base_url: "http://model".into(),
            api_key: None,
            model: "test-model".into(),
            temperature: 0.3,
            max_tokens: 256,
        }
    }

    fn desktop() -> DesktopSession {
        DesktopSession { id: "desk-test".into(), stream_url: "https://view".into() }
    }

    async fn drive(
        model: &ScriptedModel,
        sandbox: &CountingSandbox,
        sink: &CollectingSink,
    ) -> anyhow::Result<()> {
        let settings = test_settings();
        let desktop = desktop();
        let ctx = TurnContext {
            model,
            sandbox,
            desktop: &desktop,
            events: sink,
            settings: &settings,
        };
        run_turn(&ctx, &[Message::user("user-1".into(), "go".into())]).await
    }

    fn fragmented_tool_call(id: &str, name: &str, args: &str) -> Vec<CompletionEvent> {
        let (head, tail) = args.split_at(args.len() / 2);
        vec![
            CompletionEvent::ToolCallDelta {
                index: 0,
                id: Some(id.into()),
                name: Some(name.into()),
                arguments: head.into(),
            },
            CompletionEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: tail.into(),
            },
            CompletionEvent::Completed,
        ]
    }

    #[tokio::test]
    async fn text_only_turn_finishes_in_one_round() {
        let model = ScriptedModel::new(vec![vec![
            CompletionEvent::TextDelta("Hel".into()),
            CompletionEvent::TextDelta("lo".into()),
            CompletionEvent::Completed,
        ]]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        assert_eq!(model.rounds(), 1);
        assert_eq!(
            sink.events(),
            vec![
                StreamEvent::TextDelta { delta: "Hel".into() },
                StreamEvent::TextDelta { delta: "lo".into() },
                StreamEvent::Finish,
            ]
        );
    }

    #[tokio::test]
    async fn tool_every_round_stops_at_the_cap_with_one_finish() {
        let model = ScriptedModel::new(vec![fragmented_tool_call(
            "call_loop",
            "computer_use",
            r#"{"action":"mouse_move","coordinate":[5,6]}"#,
        )]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        assert_eq!(model.rounds(), MAX_ROUNDS);
        assert_eq!(sandbox.moves.load(Ordering::SeqCst), MAX_ROUNDS);
        let events = sink.events();
        let finishes = events.iter().filter(|e| **e == StreamEvent::Finish).count();
        assert_eq!(finishes, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Finish));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn screenshot_emits_output_then_side_channel_update() {
        let model = ScriptedModel::new(vec![
            fragmented_tool_call("call_shot", "computer_use", r#"{"action":"screenshot"}"#),
            vec![CompletionEvent::TextDelta("done".into()), CompletionEvent::Completed],
        ]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        let encoded = BASE64.encode([0x89, b'P', b'N', b'G']);
        let events = sink.events();
        assert_eq!(
            events[0],
            StreamEvent::ToolInputAvailable {
                tool_call_id: "call_shot".into(),
                tool_name: "computer".into(),
                input: json!({"action": "screenshot"}),
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "call_shot".into(),
                output: ToolOutput::Image { data: encoded.clone() },
            }
        );
        assert_eq!(events[2], StreamEvent::ScreenshotUpdate { screenshot: encoded });
        assert_eq!(events.last(), Some(&StreamEvent::Finish));
        assert_eq!(sandbox.screenshots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bash_reports_its_own_output_exactly_once() {
        let model = ScriptedModel::new(vec![
            fragmented_tool_call("call_sh", "bash_command", r#"{"command":"echo hello"}"#),
            vec![CompletionEvent::Completed],
        ]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        let outputs: Vec<StreamEvent> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::ToolOutputAvailable { .. }))
            .collect();
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0],
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "call_sh".into(),
                output: ToolOutput::Text { text: "hello\n".into() },
            }
        );
        assert_eq!(sandbox.execs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn only_the_first_tool_call_by_index_runs() {
        let model = ScriptedModel::new(vec![
            vec![
                // Higher index arrives first; the lower one must win.
                CompletionEvent::ToolCallDelta {
                    index: 1,
                    id: Some("call_b".into()),
                    name: Some("bash_command".into()),
                    arguments: r#"{"command":"rm -rf /"}"#.into(),
                },
                CompletionEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_a".into()),
                    name: Some("computer_use".into()),
                    arguments: r#"{"action":"mouse_move","coordinate":[1,2]}"#.into(),
                },
                CompletionEvent::Completed,
            ],
            vec![CompletionEvent::Completed],
        ]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        assert_eq!(sandbox.moves.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.execs.load(Ordering::SeqCst), 0);
        assert!(matches!(
            &sink.events()[0],
            StreamEvent::ToolInputAvailable { tool_call_id, .. } if tool_call_id == "call_a"
        ));
    }

    #[tokio::test]
    async fn unknown_action_degrades_without_ending_the_turn() {
        let model = ScriptedModel::new(vec![
            fragmented_tool_call("call_x", "computer_use", r#"{"action":"teleport"}"#),
            vec![CompletionEvent::TextDelta("ok".into()), CompletionEvent::Completed],
        ]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        drive(&model, &sandbox, &sink).await.unwrap();

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolOutputAvailable { output: ToolOutput::Text { text }, .. }
                if text == "Unknown action: teleport"
        )));
        assert_eq!(model.rounds(), 2);
        assert_eq!(events.last(), Some(&StreamEvent::Finish));
    }

    #[tokio::test]
    async fn malformed_arguments_are_turn_fatal() {
        let model = ScriptedModel::new(vec![vec![
            CompletionEvent::ToolCallDelta {
                index: 0,
                id: Some("call_bad".into()),
                name: Some("bash_command".into()),
                arguments: "{not json".into(),
            },
            CompletionEvent::Completed,
        ]]);
        let sandbox = CountingSandbox::default();
        let sink = CollectingSink::new();

        let err = drive(&model, &sandbox, &sink).await.unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
        assert!(!sink.events().iter().any(|e| *e == StreamEvent::Finish));
    }
}
