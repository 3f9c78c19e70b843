use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Handle to one remote virtual desktop.
#[derive(Debug, Clone, Deserialize)]
pub struct DesktopSession {
    pub id: String,
    pub stream_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

impl MouseButton {
    fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecOutput {
    pub stdout_b64: Option<String>,
    pub stderr_b64: Option<String>,
}

/// Seam to the Sandbox Control Service. One method per remote operation the
/// tool executor needs; implementations perform exactly one call each.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Resolve an existing desktop session or create a fresh one.
    async fn acquire(&self, existing: Option<&str>) -> anyhow::Result<DesktopSession>;
    async fn release(&self, id: &str) -> anyhow::Result<()>;
    async fn screenshot(&self, id: &str) -> anyhow::Result<Vec<u8>>;
    async fn click_mouse(
        &self,
        id: &str,
        x: i64,
        y: i64,
        button: MouseButton,
        clicks: u32,
    ) -> anyhow::Result<()>;
    async fn move_mouse(&self, id: &str, x: i64, y: i64) -> anyhow::Result<()>;
    async fn drag_mouse(&self, id: &str, from: (i64, i64), to: (i64, i64)) -> anyhow::Result<()>;
    async fn type_text(&self, id: &str, text: &str) -> anyhow::Result<()>;
    async fn press_key(&self, id: &str, key: &str) -> anyhow::Result<()>;
    async fn scroll(&self, id: &str, delta_x: i64, delta_y: i64) -> anyhow::Result<()>;
    async fn exec(&self, id: &str, command: &str) -> anyhow::Result<ExecOutput>;
}

/// Fire-and-forget teardown: no acknowledgement is awaited, failures are
/// logged and dropped.
pub fn spawn_release(api: Arc<dyn SandboxApi>, id: String) {
    tokio::spawn(async move {
        match api.release(&id).await {
            Ok(()) => info!(sandbox = %id, "sandbox released"),
            Err(err) => warn!(sandbox = %id, %err, "sandbox release failed"),
        }
    });
}

/// HTTP implementation of [`SandboxApi`].
#[derive(Clone)]
pub struct HttpSandbox {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSandbox {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self { base_url, api_key, client: reqwest::Client::new() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<reqwest::Response> {
        let resp = self
            .authorize(self.client.post(self.url(path)).json(body))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("sandbox call {path} failed: {}", resp.status());
        }
        Ok(resp)
    }
}

#[async_trait]
impl SandboxApi for HttpSandbox {
    async fn acquire(&self, existing: Option<&str>) -> anyhow::Result<DesktopSession> {
        let resp = self.post("sandboxes", &json!({ "sandbox_id": existing })).await?;
        Ok(resp.json().await?)
    }

    async fn release(&self, id: &str) -> anyhow::Result<()> {
        let resp = self
            .authorize(self.client.delete(self.url(&format!("sandboxes/{id}"))))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("sandbox release failed: {}", resp.status());
        }
        Ok(())
    }

    async fn screenshot(&self, id: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self.post(&format!("sandboxes/{id}/screenshot"), &json!({})).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn click_mouse(
        &self,
        id: &str,
        x: i64,
        y: i64,
        button: MouseButton,
        clicks: u32,
    ) -> anyhow::Result<()> {
        self.post(
            &format!("sandboxes/{id}/mouse/click"),
            &json!({ "x": x, "y": y, "button": button.as_str(), "num_clicks": clicks }),
        )
        .await?;
        Ok(())
    }

    async fn move_mouse(&self, id: &str, x: i64, y: i64) -> anyhow::Result<()> {
        self.post(&format!("sandboxes/{id}/mouse/move"), &json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn drag_mouse(&self, id: &str, from: (i64, i64), to: (i64, i64)) -> anyhow::Result<()> {
        self.post(
            &format!("sandboxes/{id}/mouse/drag"),
            &json!({
                "from": { "x": from.0, "y": from.1 },
                "to": { "x": to.0, "y": to.1 },
            }),
        )
        .await?;
        Ok(())
    }

    async fn type_text(&self, id: &str, text: &str) -> anyhow::Result<()> {
        self.post(&format!("sandboxes/{id}/keyboard/type"), &json!({ "text": text })).await?;
        Ok(())
    }

    async fn press_key(&self, id: &str, key: &str) -> anyhow::Result<()> {
        self.post(&format!("sandboxes/{id}/keyboard/key"), &json!({ "key": key })).await?;
        Ok(())
    }

    async fn scroll(&self, id: &str, delta_x: i64, delta_y: i64) -> anyhow::Result<()> {
        self.post(
            &format!("sandboxes/{id}/scroll"),
            &json!({ "delta_x": delta_x, "delta_y": delta_y }),
        )
        .await?;
        Ok(())
    }

    async fn exec(&self, id: &str, command: &str) -> anyhow::Result<ExecOutput> {
        let resp =
            self.post(&format!("sandboxes/{id}/exec"), &json!({ "command": command })).await?;
        Ok(resp.json().await?)
    }
}
