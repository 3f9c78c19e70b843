pub mod engine;
pub mod tools;

use crate::protocol::StreamEvent;

/// Sink for protocol events produced while a turn runs. The server-side
/// implementation drops events once the connection is closed; emission is
/// never awaited.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}
