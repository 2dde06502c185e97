//! Input relay
//!
//! Routes each inbound chat message to the running session, the directory
//! navigator or a conversation flow, or reports it as not ours. The answer
//! to "should the conversational layer still reply?" is computed from the
//! registry at the moment it is asked, never from a flag another step may
//! not have set yet.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat::{ChatSink, OutgoingMessage};
use crate::flows::{FlowKind, FlowReply, FlowStore};
use crate::lifecycle::{CloseReason, LifecycleController};
use crate::registry::SessionRegistry;
use crate::types::{ChatKey, ThreadState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub chat_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub text: String,
}

impl InboundMessage {
    pub fn key(&self) -> ChatKey {
        ChatKey::new(&self.chat_id, &self.thread_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayOutcome {
    /// The bridge handled the message; nothing else should
    Claimed,
    /// Pass through to the conversational layer
    NotOurs,
}

/// Commands understood inside a bridged thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCommand {
    Close,
    Cancel,
    Interrupt,
    Status,
}

impl ThreadCommand {
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim();
        let command = word.split_whitespace().next()?;
        let command = command.split('@').next().unwrap_or(command).to_ascii_lowercase();
        match command.as_str() {
            "/close" | "/exit" | "/end" => Some(ThreadCommand::Close),
            "/cancel" => Some(ThreadCommand::Cancel),
            "cancel" if word.eq_ignore_ascii_case("cancel") => Some(ThreadCommand::Cancel),
            "/interrupt" => Some(ThreadCommand::Interrupt),
            "/status" => Some(ThreadCommand::Status),
            _ => None,
        }
    }
}

pub struct InputRelay {
    controller: Arc<LifecycleController>,
    flows: Arc<FlowStore>,
    chat: Arc<dyn ChatSink>,
}

impl InputRelay {
    pub fn new(controller: Arc<LifecycleController>, flows: Arc<FlowStore>, chat: Arc<dyn ChatSink>) -> Self {
        Self {
            controller,
            flows,
            chat,
        }
    }

    fn registry(&self) -> &SessionRegistry {
        self.controller.registry()
    }

    pub fn flows(&self) -> &FlowStore {
        &self.flows
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Deliver one inbound message
    pub async fn route(&self, message: &InboundMessage) -> Result<RelayOutcome> {
        let key = message.key();
        let state = self.registry().classify(&key.thread_id);
        debug!(thread = %key.thread_id, state = state.as_str(), "Routing inbound message");

        match state {
            ThreadState::Active => {
                self.registry().request_suppress(key.clone());
                match ThreadCommand::parse(&message.text) {
                    Some(ThreadCommand::Close) => {
                        self.controller.close(&key, CloseReason::UserRequested).await?
                    }
                    Some(ThreadCommand::Interrupt) => self.controller.interrupt(&key).await?,
                    Some(ThreadCommand::Status) => self.controller.report_status(&key).await?,
                    Some(ThreadCommand::Cancel) | None => {
                        self.controller.forward_input(&key, &message.text).await?
                    }
                }
                Ok(RelayOutcome::Claimed)
            }
            ThreadState::Browsing => {
                self.registry().request_suppress(key.clone());
                match ThreadCommand::parse(&message.text) {
                    Some(ThreadCommand::Close) | Some(ThreadCommand::Cancel) => {
                        self.controller.cancel_browsing(&key).await?
                    }
                    Some(ThreadCommand::Status) | Some(ThreadCommand::Interrupt) => {
                        self.controller.report_status(&key).await?
                    }
                    None => self.controller.handle_browse_input(&key, &message.text).await?,
                }
                Ok(RelayOutcome::Claimed)
            }
            ThreadState::Spawning => {
                self.registry().request_suppress(key.clone());
                self.controller.report_status(&key).await?;
                Ok(RelayOutcome::Claimed)
            }
            ThreadState::None | ThreadState::RecentlyClosed => {
                let Some(ref user_id) = message.user_id else {
                    return Ok(RelayOutcome::NotOurs);
                };
                let reply = self.flows.on_text(&key.chat_id, user_id, &message.text);
                if reply == FlowReply::Ignored {
                    return Ok(RelayOutcome::NotOurs);
                }
                self.registry().request_suppress(key.clone());
                self.apply_flow_reply(&key.chat_id, reply).await?;
                Ok(RelayOutcome::Claimed)
            }
        }
    }

    /// Whether the conversational layer may still reply in this thread.
    /// Checks ownership now and consumes any pending suppression.
    pub fn should_reply(&self, key: &ChatKey) -> bool {
        let owned = self.registry().classify(&key.thread_id).is_owned();
        let suppressed = self.registry().take_suppress(key);
        !(owned || suppressed)
    }

    pub async fn start_flow(&self, chat_id: &str, user_id: &str, thread_id: &str, kind: FlowKind) -> Result<()> {
        let reply = self.flows.start(chat_id, user_id, thread_id, kind);
        self.apply_flow_reply(chat_id, reply).await
    }

    /// Apply a button press. Returns false when no flow claimed it.
    pub async fn press_button(&self, chat_id: &str, user_id: &str, data: &str) -> Result<bool> {
        let reply = self.flows.on_button(chat_id, user_id, data);
        if reply == FlowReply::Ignored {
            return Ok(false);
        }
        self.apply_flow_reply(chat_id, reply).await?;
        Ok(true)
    }

    async fn apply_flow_reply(&self, chat_id: &str, reply: FlowReply) -> Result<()> {
        match reply {
            FlowReply::Prompt {
                thread_id,
                text,
                buttons,
            } => {
                let key = ChatKey::new(chat_id, thread_id);
                self.chat
                    .send(OutgoingMessage::text(&key, text).with_buttons(buttons))
                    .await
            }
            FlowReply::Cancelled { thread_id, text } => {
                let key = ChatKey::new(chat_id, thread_id);
                self.chat.send(OutgoingMessage::text(&key, text)).await
            }
            FlowReply::Completed(request) => self.controller.open_browser(request).await,
            FlowReply::Ignored => Ok(()),
        }
    }
}
