use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::dispatch::{Dispatcher, ErrorCallback};
use crate::protocol::{ClientMessage, Message};
use crate::session::{SessionStore, Snapshot, Status, Subscription};
use crate::transport::{Channel, ChannelSignal, TransportError};

pub struct SessionOptions {
    /// HTTP(S) or WS(S) URL of the chat endpoint.
    pub api_url: String,
    /// Model override forwarded with every chat payload.
    pub model: Option<String>,
    pub on_error: Option<ErrorCallback>,
}

/// Client-side session: owns the store, the transport channel, and the
/// dispatcher task that applies inbound events strictly in arrival order.
pub struct OperatorSession {
    store: Arc<SessionStore>,
    channel: Arc<Channel>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    model: Option<String>,
    on_error: Option<ErrorCallback>,
}

impl OperatorSession {
    /// Build a session. The channel stays closed until the first
    /// [`OperatorSession::send_message`]. Must run inside a tokio runtime.
    pub fn new(options: SessionOptions) -> Result<Self, TransportError> {
        let store = SessionStore::new();
        let (signals, mut inbound) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel::new(&options.api_url, signals)?);
        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(options.on_error.clone())));

        // The single consumer of the ordered signal queue.
        let task_store = store.clone();
        let task_dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                match signal {
                    ChannelSignal::Event(event) => {
                        task_dispatcher.lock().await.apply(&task_store, event);
                    }
                    // Remote close: recover from a stuck streaming state.
                    ChannelSignal::Closed => task_store.update(|s| s.status = Status::Ready),
                }
            }
        });

        Ok(Self {
            store,
            channel,
            dispatcher,
            model: options.model,
            on_error: options.on_error,
        })
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(listener)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn set_input(&self, value: String) {
        self.store.update(|s| s.input = value);
    }

    pub fn set_initializing(&self, flag: bool) {
        self.store.update(|s| s.initializing = flag);
    }

    pub fn update_desktop(&self, stream_url: Option<String>, sandbox_id: Option<String>) {
        self.store.update(|s| {
            s.stream_url = stream_url;
            s.sandbox_id = sandbox_id;
        });
    }

    /// Submit one user message. A blank message, an in-flight turn, or an
    /// initializing session make this a no-op. On transport failure the
    /// error is surfaced through the error callback and status returns to
    /// ready; the user message stays in the transcript.
    pub async fn send_message(&self, text: &str, clear_input: bool) -> Result<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let snapshot = self.store.snapshot();
        if matches!(snapshot.status, Status::Streaming | Status::Submitted)
            || snapshot.initializing
        {
            return Ok(());
        }

        let mut messages = snapshot.messages.clone();
        messages.push(Message::user(format!("user-{}", Uuid::new_v4()), trimmed.to_string()));

        self.dispatcher.lock().await.reset_turn();
        let transcript = messages.clone();
        self.store.update(move |s| {
            s.messages = transcript;
            if clear_input {
                s.input.clear();
            }
            s.status = Status::Submitted;
        });

        let payload = ClientMessage::Chat {
            messages,
            timestamp: Utc::now().timestamp_millis(),
            sandbox_id: snapshot.sandbox_id.clone(),
            model: self.model.clone(),
        };
        let written = async {
            self.channel.ensure_open().await?;
            self.channel.send(&payload).await
        }
        .await;

        match written {
            Ok(()) => {
                self.store.update(|s| s.status = Status::Streaming);
                Ok(())
            }
            Err(err) => {
                if let Some(cb) = &self.on_error {
                    cb(err.to_string());
                }
                self.store.update(|s| s.status = Status::Ready);
                Err(err.into())
            }
        }
    }

    /// Close the channel and reset status locally. Does not abort an
    /// in-flight agent loop server-side; the server notices on its next send.
    pub async fn stop(&self) {
        self.channel.close().await;
        self.store.update(|s| s.status = Status::Ready);
    }
}
