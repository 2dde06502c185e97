//! Per-thread request dispatch
//!
//! Each thread gets a worker that handles its requests one at a time, in
//! arrival order. Threads run independently of each other, and a failure
//! while handling one request is logged and reported without touching any
//! other thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use relayd_core::{ChatKey, CloseReason, InputRelay, LifecycleController, RelayOutcome};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{inbound_message, Inbound, Outbound};

/// Shared handles used by every worker
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<InputRelay>,
    pub controller: Arc<LifecycleController>,
    pub out: mpsc::UnboundedSender<Outbound>,
}

struct Worker {
    tx: mpsc::UnboundedSender<Inbound>,
    /// Requests queued or in progress
    pending: Arc<AtomicUsize>,
}

pub struct Dispatcher {
    state: AppState,
    workers: Mutex<HashMap<ChatKey, Worker>>,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a request on its thread's worker, starting one if needed
    pub fn dispatch(&self, inbound: Inbound) {
        let key = inbound.key();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let worker = workers
            .entry(key.clone())
            .or_insert_with(|| spawn_worker(self.state.clone(), key.clone()));
        worker.pending.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(inbound)) = worker.tx.send(inbound) {
            // Worker died; replace it and retry once
            warn!(thread = %key.thread_id, "Thread worker gone, restarting");
            let worker = spawn_worker(self.state.clone(), key.clone());
            worker.pending.fetch_add(1, Ordering::SeqCst);
            let _ = worker.tx.send(inbound);
            workers.insert(key, worker);
        }
    }

    /// Stop idle workers of threads the bridge no longer owns
    pub fn prune(&self) -> usize {
        let registry = self.state.controller.registry();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = workers.len();
        workers.retain(|key, worker| {
            worker.pending.load(Ordering::SeqCst) > 0
                || registry.classify(&key.thread_id).is_owned()
        });
        before - workers.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn spawn_worker(state: AppState, key: ChatKey) -> Worker {
    let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
    let pending = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pending);

    tokio::spawn(async move {
        debug!(thread = %key.thread_id, "Thread worker started");
        while let Some(inbound) = rx.recv().await {
            if let Err(e) = handle(&state, inbound).await {
                warn!(thread = %key.thread_id, error = %e, "Request failed");
                let _ = state.out.send(Outbound::Error {
                    id: None,
                    message: e.to_string(),
                });
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(thread = %key.thread_id, "Thread worker stopped");
    });

    Worker { tx, pending }
}

async fn handle(state: &AppState, inbound: Inbound) -> Result<()> {
    match inbound {
        Inbound::Message {
            id,
            chat_id,
            thread_id,
            user_id,
            text,
        } => {
            let message = inbound_message(&chat_id, &thread_id, user_id.as_deref(), &text);
            let outcome = state.relay.route(&message).await?;
            state.out.send(Outbound::Relay {
                id,
                chat_id,
                thread_id,
                claimed: outcome == RelayOutcome::Claimed,
            })?;
        }
        Inbound::Browse(request) => state.controller.open_browser(request).await?,
        Inbound::Close { chat_id, thread_id } => {
            let key = ChatKey::new(chat_id, thread_id);
            state.controller.close(&key, CloseReason::UserRequested).await?
        }
        Inbound::ShouldReply {
            id,
            chat_id,
            thread_id,
        } => {
            let reply = state.relay.should_reply(&ChatKey::new(&chat_id, &thread_id));
            state.out.send(Outbound::ShouldReply {
                id,
                chat_id,
                thread_id,
                reply,
            })?;
        }
        Inbound::FlowStart {
            chat_id,
            thread_id,
            user_id,
            kind,
        } => {
            state
                .relay
                .start_flow(&chat_id, &user_id, &thread_id, kind)
                .await?
        }
        Inbound::Button {
            chat_id,
            thread_id,
            user_id,
            data,
        } => {
            if !state.relay.press_button(&chat_id, &user_id, &data).await? {
                debug!(thread = %thread_id, data = %data, "Button not claimed by any flow");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stdio::StdoutChatSink;
    use relayd_core::{
        BridgeConfig, FlowStore, MachineRegistry, OpenSshTransport, SessionRegistry,
    };

    fn state() -> (AppState, mpsc::UnboundedReceiver<Outbound>) {
        let (out, rx) = mpsc::unbounded_channel();
        let config = BridgeConfig::default();
        let chat = Arc::new(StdoutChatSink::new(out.clone()));
        let flows = Arc::new(FlowStore::new(
            config.flow_ttl(),
            Vec::new(),
            config.engine_names(),
        ));
        let controller = Arc::new(LifecycleController::new(
            Arc::new(config.clone()),
            Arc::new(MachineRegistry::default()),
            Arc::new(SessionRegistry::new(config.ttls())),
            Arc::new(OpenSshTransport::new()),
            chat.clone(),
        ));
        let relay = Arc::new(InputRelay::new(Arc::clone(&controller), flows, chat));
        (AppState { relay, controller, out }, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unowned_message_is_not_claimed() {
        let (state, mut rx) = state();
        let dispatcher = Dispatcher::new(state);

        dispatcher.dispatch(Inbound::Message {
            id: Some("m1".to_string()),
            chat_id: "c1".to_string(),
            thread_id: "t1".to_string(),
            user_id: None,
            text: "hello".to_string(),
        });
        dispatcher.dispatch(Inbound::ShouldReply {
            id: Some("q1".to_string()),
            chat_id: "c1".to_string(),
            thread_id: "t1".to_string(),
        });

        match next(&mut rx).await {
            Outbound::Relay { id, claimed, .. } => {
                assert_eq!(id.as_deref(), Some("m1"));
                assert!(!claimed);
            }
            other => panic!("expected relay verdict, got {:?}", other),
        }
        match next(&mut rx).await {
            Outbound::ShouldReply { id, reply, .. } => {
                assert_eq!(id.as_deref(), Some("q1"));
                assert!(reply);
            }
            other => panic!("expected should_reply verdict, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.worker_count(), 1);
        assert_eq!(dispatcher.prune(), 1);
        assert_eq!(dispatcher.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_browse_unknown_machine_reports_into_thread() {
        let (state, mut rx) = state();
        let dispatcher = Dispatcher::new(state);

        let request = serde_json::from_str(
            r#"{"type":"browse","chatId":"c1","threadId":"t2","machine":"ghost"}"#,
        )
        .unwrap();
        dispatcher.dispatch(request);

        match next(&mut rx).await {
            Outbound::Send(message) => {
                assert_eq!(message.thread_id, "t2");
                assert!(message.text.contains("Unknown machine: ghost"));
            }
            other => panic!("expected send, got {:?}", other),
        }
    }
}
