//! Boundary to the chat transport.
//!
//! The core consumes incoming messages as values on a channel and hands
//! outgoing text to [`ChatTransport::send`]; nothing else about the
//! transport's wire protocol is assumed.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, room_id: &str, text: &str) -> anyhow::Result<()>;
}
