//! Chat transport seam

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::terminal::segment;
use crate::types::ChatKey;

/// Quick-reply button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub thread_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl OutgoingMessage {
    pub fn text(key: &ChatKey, text: impl Into<String>) -> Self {
        Self {
            chat_id: key.chat_id.clone(),
            thread_id: key.thread_id.clone(),
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Send one message; must not reorder relative to earlier sends
    async fn send(&self, message: OutgoingMessage) -> Result<()>;
}

/// Segment `text` to the transport limit and send the chunks one after
/// another. Returns the number of messages sent.
pub async fn deliver(sink: &dyn ChatSink, key: &ChatKey, text: &str, limit: usize) -> Result<usize> {
    let chunks = segment(text, limit);
    let count = chunks.len();
    for chunk in chunks {
        sink.send(OutgoingMessage::text(key, chunk)).await?;
    }
    if count > 1 {
        debug!(thread = %key.thread_id, chunks = count, "Delivered segmented output");
    }
    Ok(count)
}
