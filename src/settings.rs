use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelSettings {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: env_or("OPERATOR_MODEL", "gpt-4o-mini"),
            temperature: std::env::var("OPERATOR_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.3),
            max_tokens: std::env::var("OPERATOR_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxSettings {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl SandboxSettings {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("SANDBOX_BASE_URL", "http://127.0.0.1:8320"),
            api_key: std::env::var("SANDBOX_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub model: ModelSettings,
    pub sandbox: SandboxSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self { model: ModelSettings::from_env(), sandbox: SandboxSettings::from_env() }
    }
}

/// Per-request knobs carried in the chat payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestOverrides {
    pub model: Option<String>,
}

/// Request override wins over the configured default.
pub fn resolve_effective_model(overrides: &RequestOverrides, settings: &ModelSettings) -> String {
    overrides.model.clone().unwrap_or_else(|| settings.model.clone())
}
