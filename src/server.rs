use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::EventSink;
use crate::agent::engine::{self, TurnContext};
use crate::models::LanguageModel;
use crate::protocol::{ClientMessage, Message, StreamEvent};
use crate::sandbox::{self, SandboxApi};
use crate::settings::{RequestOverrides, Settings, resolve_effective_model};

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn LanguageModel>,
    pub sandbox: Arc<dyn SandboxApi>,
    pub settings: Arc<Settings>,
}

/// Per-connection record. The closed flag suppresses event emission after
/// disconnect; the sandbox id is taken out exactly once on release, whichever
/// exit path gets there first.
#[derive(Default)]
pub struct ActiveStream {
    sandbox_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ActiveStream {
    pub fn set_sandbox(&self, id: String) {
        *self.sandbox_id.lock().expect("sandbox id lock") = Some(id);
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn take_sandbox(&self) -> Option<String> {
        self.sandbox_id.lock().expect("sandbox id lock").take()
    }
}

/// Serializes protocol events onto the connection writer. Events emitted
/// after the connection closed are dropped silently.
#[derive(Clone)]
pub struct EventSender {
    frames: mpsc::UnboundedSender<String>,
    stream: Arc<ActiveStream>,
}

impl EventSink for EventSender {
    fn emit(&self, event: StreamEvent) {
        if self.stream.is_closed() {
            return;
        }
        match serde_json::to_string(&event) {
            Ok(text) => {
                if self.frames.send(text).is_err() {
                    debug!("dropping event, connection writer is gone");
                }
            }
            Err(err) => warn!(%err, "failed to encode event"),
        }
    }
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    counter!("operator_connections_total").increment(1);
    let (mut sink, mut inbound) = socket.split();
    let (frames, mut outbound) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let active = Arc::new(ActiveStream::default());
    let events = EventSender { frames, stream: active.clone() };

    // Chat requests run strictly sequentially: the next frame is not read
    // until the current turn is over.
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(%err, "dropping malformed client frame");
                        continue;
                    }
                };
                let ClientMessage::Chat { messages, sandbox_id, model, .. } = parsed;
                handle_chat(&state, &events, &active, messages, sandbox_id, model).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "connection read failed");
                break;
            }
        }
    }

    active.mark_closed();
    release_sandbox(&state, &active);
    writer.abort();
}

/// One chat turn: acquire (or reuse) the desktop, run the agent loop, and on
/// failure release the sandbox and surface a single error event.
async fn handle_chat(
    state: &AppState,
    events: &EventSender,
    active: &Arc<ActiveStream>,
    messages: Vec<Message>,
    sandbox_id: Option<String>,
    model_override: Option<String>,
) {
    let turn = async {
        let desktop = state.sandbox.acquire(sandbox_id.as_deref()).await?;
        active.set_sandbox(desktop.id.clone());

        let mut model_settings = state.settings.model.clone();
        model_settings.model = resolve_effective_model(
            &RequestOverrides { model: model_override },
            &model_settings,
        );
        let ctx = TurnContext {
            model: state.model.as_ref(),
            sandbox: state.sandbox.as_ref(),
            desktop: &desktop,
            events,
            settings: &model_settings,
        };
        engine::run_turn(&ctx, &messages).await
    }
    .await;

    if let Err(err) = turn {
        warn!(%err, "chat turn failed");
        release_sandbox(state, active);
        events.emit(StreamEvent::Error { error_text: err.to_string() });
    }
}

fn release_sandbox(state: &AppState, active: &ActiveStream) {
    if let Some(id) = active.take_sandbox() {
        sandbox::spawn_release(state.sandbox.clone(), id);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat-ws", get(chat_ws))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    metrics: Option<PrometheusHandle>,
) -> anyhow::Result<()> {
    let mut app = router(state);
    if let Some(handle) = metrics {
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
