//! Button-driven conversation flows
//!
//! A flow walks the user through picking a machine, an engine and a task
//! prompt, then turns the selections into a [`BrowseRequest`]. Flows are
//! keyed by (chat, user), expire after a TTL and are replaced wholesale when
//! restarted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::chat::Button;
use crate::lifecycle::BrowseRequest;
use crate::registry::{Clock, TokioClock};
use crate::types::DispatchMode;

const DATA_PREFIX: &str = "flow:";
const CANCEL_DATA: &str = "flow:cancel";
const CONFIRM_DATA: &str = "flow:confirm";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Start an interactive session in a thread
    #[default]
    NewSession,
    /// Submit the task to the queue instead of running it inline
    QueueTask,
}

impl FlowKind {
    fn dispatch(self) -> DispatchMode {
        match self {
            FlowKind::NewSession => DispatchMode::Inline,
            FlowKind::QueueTask => DispatchMode::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    PickMachine,
    PickEngine,
    EnterPrompt,
    Confirm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowSelections {
    pub machine: Option<String>,
    pub engine: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationFlow {
    pub kind: FlowKind,
    pub step: FlowStep,
    pub chat_id: String,
    pub thread_id: String,
    pub selections: FlowSelections,
    /// Buttons shown for the current step
    pub choices: Vec<Button>,
    pub created_at: Instant,
    touched_at: Instant,
}

/// What to tell the user after a flow interaction
#[derive(Debug, Clone, PartialEq)]
pub enum FlowReply {
    Prompt {
        thread_id: String,
        text: String,
        buttons: Vec<Button>,
    },
    Completed(BrowseRequest),
    Cancelled {
        thread_id: String,
        text: String,
    },
    /// Not a flow interaction
    Ignored,
}

type FlowKey = (String, String);

pub struct FlowStore {
    flows: Mutex<HashMap<FlowKey, ConversationFlow>>,
    ttl: Duration,
    machines: Vec<String>,
    engines: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl FlowStore {
    pub fn new(ttl: Duration, machines: Vec<String>, engines: Vec<String>) -> Self {
        Self::with_clock(ttl, machines, engines, Arc::new(TokioClock))
    }

    pub fn with_clock(ttl: Duration, machines: Vec<String>, engines: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            ttl,
            machines,
            engines,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FlowKey, ConversationFlow>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(chat_id: &str, user_id: &str) -> FlowKey {
        (chat_id.to_string(), user_id.to_string())
    }

    /// Live flow for (chat, user), dropping it if expired
    fn live<'a>(
        &self,
        flows: &'a mut HashMap<FlowKey, ConversationFlow>,
        key: &FlowKey,
    ) -> Option<&'a mut ConversationFlow> {
        let now = self.clock.now();
        let expired = flows
            .get(key)
            .is_some_and(|f| now.duration_since(f.touched_at) >= self.ttl);
        if expired {
            debug!(chat = %key.0, user = %key.1, "Conversation flow expired");
            flows.remove(key);
        }
        flows.get_mut(key)
    }

    /// Begin a flow, replacing any earlier one for this user
    pub fn start(&self, chat_id: &str, user_id: &str, thread_id: &str, kind: FlowKind) -> FlowReply {
        if self.machines.is_empty() {
            return FlowReply::Cancelled {
                thread_id: thread_id.to_string(),
                text: "❌ No machines are configured.".to_string(),
            };
        }
        let now = self.clock.now();
        let mut flow = ConversationFlow {
            kind,
            step: FlowStep::PickMachine,
            chat_id: chat_id.to_string(),
            thread_id: thread_id.to_string(),
            selections: FlowSelections::default(),
            choices: Vec::new(),
            created_at: now,
            touched_at: now,
        };
        let reply = self.render(&mut flow);
        if self.lock().insert(Self::key(chat_id, user_id), flow).is_some() {
            debug!(chat = %chat_id, user = %user_id, "Replaced conversation flow");
        }
        reply
    }

    /// Apply a button press
    pub fn on_button(&self, chat_id: &str, user_id: &str, data: &str) -> FlowReply {
        let Some(choice) = data.strip_prefix(DATA_PREFIX) else {
            return FlowReply::Ignored;
        };
        let key = Self::key(chat_id, user_id);
        let mut flows = self.lock();
        let Some(flow) = self.live(&mut flows, &key) else {
            return FlowReply::Ignored;
        };
        let thread_id = flow.thread_id.clone();

        if data == CANCEL_DATA {
            flows.remove(&key);
            return FlowReply::Cancelled {
                thread_id,
                text: "🚫 Cancelled.".to_string(),
            };
        }

        match (flow.step, choice.split_once(':')) {
            (FlowStep::PickMachine, Some(("machine", name))) if self.machines.iter().any(|m| m == name) => {
                flow.selections.machine = Some(name.to_string());
                flow.step = FlowStep::PickEngine;
            }
            (FlowStep::PickEngine, Some(("engine", name))) if self.engines.iter().any(|e| e == name) => {
                flow.selections.engine = Some(name.to_string());
                flow.step = FlowStep::EnterPrompt;
            }
            (FlowStep::Confirm, None) if data == CONFIRM_DATA => {
                let flow = match flows.remove(&key) {
                    Some(flow) => flow,
                    None => return FlowReply::Ignored,
                };
                return FlowReply::Completed(Self::request(&flow));
            }
            _ => {
                debug!(chat = %chat_id, data = %data, "Stale flow button");
                return FlowReply::Ignored;
            }
        }
        flow.touched_at = self.clock.now();
        self.render(flow)
    }

    /// Apply a text reply; only the prompt step consumes text
    pub fn on_text(&self, chat_id: &str, user_id: &str, text: &str) -> FlowReply {
        let key = Self::key(chat_id, user_id);
        let mut flows = self.lock();
        let Some(flow) = self.live(&mut flows, &key) else {
            return FlowReply::Ignored;
        };
        let text = text.trim();
        if flow.step != FlowStep::EnterPrompt || text.is_empty() {
            return FlowReply::Ignored;
        }
        flow.selections.prompt = Some(text.to_string());
        flow.step = FlowStep::Confirm;
        flow.touched_at = self.clock.now();
        self.render(flow)
    }

    pub fn get(&self, chat_id: &str, user_id: &str) -> Option<ConversationFlow> {
        let key = Self::key(chat_id, user_id);
        let mut flows = self.lock();
        self.live(&mut flows, &key).cloned()
    }

    /// Drop expired flows; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut flows = self.lock();
        let before = flows.len();
        flows.retain(|_, f| now.duration_since(f.touched_at) < self.ttl);
        before - flows.len()
    }

    fn render(&self, flow: &mut ConversationFlow) -> FlowReply {
        let cancel = Button::new("Cancel", CANCEL_DATA);
        let (text, mut buttons) = match flow.step {
            FlowStep::PickMachine => (
                "🖥 Pick a machine:".to_string(),
                self.machines
                    .iter()
                    .map(|m| Button::new(m, format!("{}machine:{}", DATA_PREFIX, m)))
                    .collect::<Vec<_>>(),
            ),
            FlowStep::PickEngine => (
                "🤖 Pick an engine:".to_string(),
                self.engines
                    .iter()
                    .map(|e| Button::new(e, format!("{}engine:{}", DATA_PREFIX, e)))
                    .collect(),
            ),
            FlowStep::EnterPrompt => ("✏️ Describe the task:".to_string(), Vec::new()),
            FlowStep::Confirm => {
                let s = &flow.selections;
                let verb = match flow.kind {
                    FlowKind::NewSession => "Start",
                    FlowKind::QueueTask => "Queue",
                };
                (
                    format!(
                        "{} {} on {}?\n\n{}",
                        verb,
                        s.engine.as_deref().unwrap_or("?"),
                        s.machine.as_deref().unwrap_or("?"),
                        s.prompt.as_deref().unwrap_or("")
                    ),
                    vec![Button::new("Confirm", CONFIRM_DATA)],
                )
            }
        };
        buttons.push(cancel);
        flow.choices = buttons.clone();
        FlowReply::Prompt {
            thread_id: flow.thread_id.clone(),
            text,
            buttons,
        }
    }

    fn request(flow: &ConversationFlow) -> BrowseRequest {
        BrowseRequest {
            chat_id: flow.chat_id.clone(),
            thread_id: flow.thread_id.clone(),
            machine: flow.selections.machine.clone().unwrap_or_default(),
            path: None,
            prompt: flow.selections.prompt.clone().unwrap_or_default(),
            engine: flow.selections.engine.clone(),
            output_mode: None,
            dispatch: flow.kind.dispatch(),
            project: None,
            parent_task_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ManualClock;

    fn store(clock: Arc<ManualClock>) -> FlowStore {
        FlowStore::with_clock(
            Duration::from_secs(300),
            vec!["buildbox".to_string(), "winbox".to_string()],
            vec!["claude".to_string(), "codex".to_string()],
            clock,
        )
    }

    fn buttons(reply: &FlowReply) -> Vec<String> {
        match reply {
            FlowReply::Prompt { buttons, .. } => buttons.iter().map(|b| b.data.clone()).collect(),
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_full_flow_completes_with_browse_request() {
        let flows = store(Arc::new(ManualClock::new()));

        let reply = flows.start("c1", "u1", "t1", FlowKind::NewSession);
        assert_eq!(
            buttons(&reply),
            vec!["flow:machine:buildbox", "flow:machine:winbox", "flow:cancel"]
        );

        let reply = flows.on_button("c1", "u1", "flow:machine:winbox");
        assert!(buttons(&reply).contains(&"flow:engine:codex".to_string()));

        let reply = flows.on_button("c1", "u1", "flow:engine:codex");
        assert_eq!(buttons(&reply), vec!["flow:cancel"]);
        assert_eq!(flows.get("c1", "u1").unwrap().step, FlowStep::EnterPrompt);

        let reply = flows.on_text("c1", "u1", "  port the build to cmake ");
        assert_eq!(buttons(&reply), vec!["flow:confirm", "flow:cancel"]);

        match flows.on_button("c1", "u1", "flow:confirm") {
            FlowReply::Completed(req) => {
                assert_eq!(req.machine, "winbox");
                assert_eq!(req.engine.as_deref(), Some("codex"));
                assert_eq!(req.prompt, "port the build to cmake");
                assert_eq!(req.thread_id, "t1");
                assert_eq!(req.dispatch, DispatchMode::Inline);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(flows.get("c1", "u1").is_none());
    }

    #[test]
    fn test_text_outside_prompt_step_is_ignored() {
        let flows = store(Arc::new(ManualClock::new()));
        flows.start("c1", "u1", "t1", FlowKind::NewSession);
        assert_eq!(flows.on_text("c1", "u1", "hello"), FlowReply::Ignored);
        assert_eq!(flows.on_text("c1", "other", "hello"), FlowReply::Ignored);
    }

    #[test]
    fn test_stale_and_foreign_buttons_ignored() {
        let flows = store(Arc::new(ManualClock::new()));
        flows.start("c1", "u1", "t1", FlowKind::NewSession);
        assert_eq!(flows.on_button("c1", "u1", "flow:engine:claude"), FlowReply::Ignored);
        assert_eq!(flows.on_button("c1", "u1", "flow:machine:unknown"), FlowReply::Ignored);
        assert_eq!(flows.on_button("c1", "u1", "approve:42"), FlowReply::Ignored);
        assert_eq!(flows.get("c1", "u1").unwrap().step, FlowStep::PickMachine);
    }

    #[test]
    fn test_restart_replaces_flow() {
        let flows = store(Arc::new(ManualClock::new()));
        flows.start("c1", "u1", "t1", FlowKind::NewSession);
        flows.on_button("c1", "u1", "flow:machine:buildbox");

        flows.start("c1", "u1", "t2", FlowKind::QueueTask);
        let flow = flows.get("c1", "u1").unwrap();
        assert_eq!(flow.step, FlowStep::PickMachine);
        assert_eq!(flow.thread_id, "t2");
        assert_eq!(flow.kind, FlowKind::QueueTask);
        assert_eq!(flow.selections, FlowSelections::default());
    }

    #[test]
    fn test_cancel_removes_flow() {
        let flows = store(Arc::new(ManualClock::new()));
        flows.start("c1", "u1", "t1", FlowKind::NewSession);
        match flows.on_button("c1", "u1", "flow:cancel") {
            FlowReply::Cancelled { thread_id, .. } => assert_eq!(thread_id, "t1"),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert!(flows.get("c1", "u1").is_none());
    }

    #[test]
    fn test_ttl_expiry_and_sweep() {
        let clock = Arc::new(ManualClock::new());
        let flows = store(clock.clone());
        flows.start("c1", "u1", "t1", FlowKind::NewSession);
        flows.start("c1", "u2", "t2", FlowKind::NewSession);

        clock.advance(Duration::from_secs(200));
        flows.on_button("c1", "u2", "flow:machine:buildbox");

        clock.advance(Duration::from_secs(150));
        assert_eq!(flows.sweep(), 1);
        assert!(flows.get("c1", "u1").is_none());
        assert!(flows.get("c1", "u2").is_some());

        clock.advance(Duration::from_secs(300));
        assert_eq!(flows.on_button("c1", "u2", "flow:engine:claude"), FlowReply::Ignored);
    }

    #[test]
    fn test_queue_flow_dispatches_queued() {
        let flows = store(Arc::new(ManualClock::new()));
        flows.start("c1", "u1", "t1", FlowKind::QueueTask);
        flows.on_button("c1", "u1", "flow:machine:buildbox");
        flows.on_button("c1", "u1", "flow:engine:claude");
        flows.on_text("c1", "u1", "bump deps");
        match flows.on_button("c1", "u1", "flow:confirm") {
            FlowReply::Completed(req) => assert_eq!(req.dispatch, DispatchMode::Queued),
            other => panic!("expected completion, got {:?}", other),
        }
    }
}
