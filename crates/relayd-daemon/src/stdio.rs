//! Stdout side of the chat protocol
//!
//! Every outbound line goes through one writer task, so messages reach the
//! front end in the order they were produced.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relayd_core::{ChatSink, OutgoingMessage};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::Outbound;

/// Chat sink that queues `send` lines for the writer task
#[derive(Debug, Clone)]
pub struct StdoutChatSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl StdoutChatSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChatSink for StdoutChatSink {
    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.tx
            .send(Outbound::Send(message))
            .map_err(|_| anyhow!("chat writer has stopped"))
    }
}

/// Serialize lines until every sender is dropped
pub async fn run_writer<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound line");
                continue;
            }
        };
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        written += 1;
    }
    debug!(lines = written, "Chat writer finished");
    Ok(())
}
