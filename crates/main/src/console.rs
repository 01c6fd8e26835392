//! Line-based console transport for local runs.
//!
//! Incoming lines are `room:user:text` (or bare text, attributed to a
//! default room and user); outgoing messages are printed with their
//! room tag. Real deployments plug a chat platform into the same
//! [`ChatTransport`] seam.

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::info;

use bot::transport::{ChatTransport, IncomingMessage};

const DEFAULT_ROOM: &str = "console";
const DEFAULT_USER: &str = "local";

pub struct ConsoleTransport {}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(&self, room_id: &str, text: &str) -> anyhow::Result<()> {
        println!("[{room_id}]\n{text}\n");
        Ok(())
    }
}

pub fn parse_line(line: &str) -> Option<IncomingMessage> {
    let line = line.trim();

    if line.is_empty() {
        return None;
    }

    let (room_id, sender_id, text) = match line.split_once(':') {
        Some((room, rest)) => match rest.split_once(':') {
            Some((user, text)) => (room, user, text),
            None => (DEFAULT_ROOM, DEFAULT_USER, line),
        },
        None => (DEFAULT_ROOM, DEFAULT_USER, line),
    };

    Some(IncomingMessage {
        room_id: room_id.to_owned(),
        sender_id: sender_id.to_owned(),
        text: text.trim().to_owned(),
    })
}

/// Feeds stdin lines into the message channel until EOF.
pub async fn read_stdin(message_tx: mpsc::Sender<IncomingMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(message) = parse_line(&line) else {
            continue;
        };

        if message_tx.send(message).await.is_err() {
            return;
        }
    }

    info!("Console input closed.");
}
