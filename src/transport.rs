use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::StreamEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is not open")]
    NotConnected,
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the receive loop hands the dispatcher, in arrival order.
#[derive(Debug)]
pub enum ChannelSignal {
    Event(StreamEvent),
    Closed,
}

struct Connection {
    writer: mpsc::UnboundedSender<WsMessage>,
    open: Arc<AtomicBool>,
}

/// Owns one duplex streaming connection. Established lazily by
/// [`Channel::ensure_open`]; decoded inbound events flow through the signal
/// queue handed in at construction, preserving arrival order.
pub struct Channel {
    endpoint: String,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    connection: Mutex<Option<Connection>>,
}

impl Channel {
    pub fn new(
        api_url: &str,
        signals: mpsc::UnboundedSender<ChannelSignal>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: websocket_endpoint(api_url)?,
            signals,
            connection: Mutex::new(None),
        })
    }

    /// Open the channel if it is not already open. An open channel resolves
    /// immediately; concurrent callers await the in-flight attempt (the
    /// connect runs under the connection lock); a previously closed channel
    /// gets a fresh connection.
    pub async fn ensure_open(&self) -> Result<(), TransportError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.open.load(Ordering::Acquire) {
                return Ok(());
            }
        }

        let (socket, _) = tokio_tungstenite::connect_async(self.endpoint.as_str()).await?;
        let (mut sink, mut stream) = socket.split();
        let open = Arc::new(AtomicBool::new(true));

        let (writer, mut outbound) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let signals = self.signals.clone();
        let open_flag = open.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<StreamEvent>(&text) {
                        Ok(event) => {
                            let _ = signals.send(ChannelSignal::Event(event));
                        }
                        Err(err) => warn!(%err, "dropping malformed frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "websocket read failed");
                        break;
                    }
                }
            }
            open_flag.store(false, Ordering::Release);
            let _ = signals.send(ChannelSignal::Closed);
        });

        *slot = Some(Connection { writer, open });
        Ok(())
    }

    /// Write one JSON payload. Fails with [`TransportError::NotConnected`]
    /// when the channel is not open; nothing is queued for later.
    pub async fn send(&self, payload: &impl Serialize) -> Result<(), TransportError> {
        let slot = self.connection.lock().await;
        let connection = slot
            .as_ref()
            .filter(|c| c.open.load(Ordering::Acquire))
            .ok_or(TransportError::NotConnected)?;
        let text = serde_json::to_string(payload)?;
        connection
            .writer
            .send(WsMessage::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Terminate the channel and clear cached connection state so the next
    /// [`Channel::ensure_open`] starts fresh.
    pub async fn close(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.take() {
            connection.open.store(false, Ordering::Release);
            let _ = connection.writer.send(WsMessage::Close(None));
        }
    }
}

fn websocket_endpoint(api_url: &str) -> Result<String, TransportError> {
    let mut url =
        Url::parse(api_url).map_err(|_| TransportError::InvalidUrl(api_url.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(TransportError::InvalidUrl(api_url.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(api_url.to_string()))?;
    Ok(url.into())
}
