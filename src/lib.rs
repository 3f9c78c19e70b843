//! Streaming AI operator for a remote virtual desktop.
//!
//! One WebSocket carries a chat session: the client half ([`client`],
//! [`session`], [`dispatch`], [`transport`]) reconciles the incremental event
//! stream into a render-ready transcript; the server half ([`server`],
//! [`agent`], [`sandbox`], [`models`]) interleaves streamed model completions
//! with tool execution against a remote desktop.

pub mod agent;
pub mod client;
pub mod dispatch;
pub mod models;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod settings;
pub mod transport;
