use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

/// One decoded fragment of a streamed completion. Tool-call arguments arrive
/// as string fragments keyed by the call's declared index; the loop
/// reassembles them in arrival order and parses once complete.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    TextDelta(String),
    ToolCallDelta {
        index: u64,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Completed,
}

/// Ordered receiver half of one streamed completion.
pub struct CompletionStream {
    rx: mpsc::Receiver<anyhow::Result<CompletionEvent>>,
}

impl CompletionStream {
    pub async fn next(&mut self) -> Option<anyhow::Result<CompletionEvent>> {
        self.rx.recv().await
    }

    /// A stream that replays a fixed script. Test seam for loop-level tests.
    pub fn from_events(events: Vec<CompletionEvent>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Self { rx }
    }
}

pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Value],
    pub tools: &'a Value,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(&self, req: CompletionRequest<'_>) -> anyhow::Result<CompletionStream>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint consumed as
/// an SSE stream.
#[derive(Clone)]
pub struct OpenAICompatible {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self { base_url, api_key, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn stream_chat(&self, req: CompletionRequest<'_>) -> anyhow::Result<CompletionStream> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": req.model,
            "messages": req.messages,
            "tools": req.tools,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": true,
        });

        debug!(%url, model = req.model, "opening completion stream");
        let mut rb = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(process_sse(resp.bytes_stream(), tx));
        Ok(CompletionStream { rx })
    }
}

async fn process_sse<S>(stream: S, tx: mpsc::Sender<anyhow::Result<CompletionEvent>>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Err(anyhow!("completion stream error: {err}"))).await;
                return;
            }
        };
        // The wire terminates with a literal "[DONE]" data line.
        if frame.data.trim() == "[DONE]" {
            let _ = tx.send(Ok(CompletionEvent::Completed)).await;
            return;
        }
        let chunk: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        for event in decode_chunk(&chunk) {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(Ok(CompletionEvent::Completed)).await;
}

fn decode_chunk(chunk: &Value) -> Vec<CompletionEvent> {
    let mut events = Vec::new();
    let Some(delta) = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
    else {
        return events;
    };

    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(CompletionEvent::TextDelta(content.to_string()));
        }
    }

    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let Some(index) = call.get("index").and_then(Value::as_u64) else {
                continue;
            };
            let function = call.get("function");
            events.push(CompletionEvent::ToolCallDelta {
                index,
                id: call.get("id").and_then(Value::as_str).map(str::to_string),
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                arguments: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::post;
    use serde_json::json;

    #[test]
    fn decode_chunk_extracts_text_delta() {
        let chunk = json!({"choices": [{"delta": {"content": "Hel"}}]});
        assert_eq!(
            decode_chunk(&chunk),
            vec![CompletionEvent::TextDelta("Hel".into())]
        );
    }

    #[test]
    fn decode_chunk_skips_empty_content_and_missing_choices() {
        assert!(decode_chunk(&json!({"choices": [{"delta": {"content": ""}}]})).is_empty());
        assert!(decode_chunk(&json!({"choices": []})).is_empty());
        assert!(decode_chunk(&json!({"object": "ping"})).is_empty());
    }

    #[test]
    fn decode_chunk_extracts_tool_call_fragments() {
        let chunk = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "computer_use", "arguments": "{\"ac"}},
            {"index": 1, "function": {"arguments": "tail"}}
        ]}}]});
        assert_eq!(
            decode_chunk(&chunk),
            vec![
                CompletionEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_1".into()),
                    name: Some("computer_use".into()),
                    arguments: "{\"ac".into(),
                },
                CompletionEvent::ToolCallDelta {
                    index: 1,
                    id: None,
                    name: None,
                    arguments: "tail".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn stream_chat_consumes_sse_until_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let model = OpenAICompatible::new(format!("http://{addr}/v1"), None);
        let mut stream = model
            .stream_chat(CompletionRequest {
                model: "test-model",
                messages: &[json!({"role": "user", "content": "hi"})],
                tools: &json!([]),
                temperature: 0.3,
                max_tokens: 64,
            })
            .await
            .unwrap();

        let mut text = String::new();
        loop {
            match stream.next().await.expect("stream ended early").unwrap() {
                CompletionEvent::TextDelta(delta) => text.push_str(&delta),
                CompletionEvent::Completed => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(text, "Hello");
    }
}
