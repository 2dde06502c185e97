//! Session lifecycle controller
//!
//! The only component that moves a thread between browsing, spawning,
//! active and closed. Registry transitions happen before and after network
//! calls, never around them.

mod command;
mod question;
mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browse::{
    listing_command, parse_input, parse_listing, render_listing, BrowsingSession, NavAction,
    LISTING_NO_DIR_EXIT,
};
use crate::chat::{deliver, ChatSink};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::queue::{TaskQueue, TaskRequest, UnconfiguredQueue};
use crate::registry::{ActiveEntry, SessionRegistry};
use crate::ssh::{last_lines, RemoteHandle, RemoteTransport, SpawnSpec};
use crate::transcript::{NoopAnalyzer, TranscriptAnalyzer};
use crate::types::{ChatKey, DispatchMode, Machine, MachineRegistry, OutputMode, ThreadState};

pub use command::{engine_invocation, session_command, EngineInvocation, READY_MARKER};
pub use question::{answer_keys, detect_question, PendingQuestion, QuestionKind};
pub use session::{CloseReason, SessionCommand, SessionStatus};

use session::{short_id, ActiveSession, SessionInfo, SessionLimits};

/// Output after the ready marker is watched this long; an engine that
/// exits inside the window failed to start
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// How long `close` waits for the session task to finish its cleanup
const CLOSE_WAIT: Duration = Duration::from_secs(10);

const STATUS_WAIT: Duration = Duration::from_secs(5);

/// Request to start browsing a remote machine in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseRequest {
    pub chat_id: String,
    pub thread_id: String,
    pub machine: String,
    /// Starting directory, `~` when absent
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub output_mode: Option<OutputMode>,
    #[serde(default)]
    pub dispatch: DispatchMode,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
}

impl BrowseRequest {
    pub fn key(&self) -> ChatKey {
        ChatKey::new(&self.chat_id, &self.thread_id)
    }
}

/// Drives browsing and sessions for every thread.
///
/// Public operations report user-facing failures into the thread and only
/// return `Err` when the chat transport itself fails.
pub struct LifecycleController {
    config: Arc<BridgeConfig>,
    machines: Arc<MachineRegistry>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn RemoteTransport>,
    chat: Arc<dyn ChatSink>,
    analyzer: Arc<dyn TranscriptAnalyzer>,
    queue: Arc<dyn TaskQueue>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<BridgeConfig>,
        machines: Arc<MachineRegistry>,
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn RemoteTransport>,
        chat: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            config,
            machines,
            registry,
            transport,
            chat,
            analyzer: Arc::new(NoopAnalyzer),
            queue: Arc::new(UnconfiguredQueue),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn TranscriptAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.machines
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    async fn say(&self, key: &ChatKey, text: impl AsRef<str>) -> Result<()> {
        deliver(self.chat.as_ref(), key, text.as_ref(), self.config.max_message_len).await?;
        Ok(())
    }

    // ============ Browsing ============

    /// List the starting directory and put the thread into browsing
    pub async fn open_browser(&self, request: BrowseRequest) -> Result<()> {
        let key = request.key();
        let machine = match self.machines.get(&request.machine) {
            Ok(m) => m.clone(),
            Err(e) => return self.say(&key, format!("❌ {}", e)).await,
        };
        let (engine, _) = match self.config.engine(request.engine.as_deref()) {
            Ok(found) => found,
            Err(e) => {
                let known = self.config.engine_names().join(", ");
                return self.say(&key, format!("❌ {}. Available: {}", e, known)).await;
            }
        };

        match self.registry.classify(&key.thread_id) {
            ThreadState::Active | ThreadState::Spawning => {
                return self
                    .say(&key, "⚠️ A session is already running in this thread. Send /close first.")
                    .await;
            }
            _ => {}
        }

        let path = request.path.clone().unwrap_or_else(|| "~".to_string());
        let listing = match self.list_directory(&machine, &path).await {
            Ok(listing) => listing,
            Err(message) => return self.say(&key, format!("❌ {}", message)).await,
        };

        let session = BrowsingSession {
            thread_id: key.thread_id.clone(),
            chat_id: key.chat_id.clone(),
            machine: machine.name.clone(),
            current_path: path,
            prompt: request.prompt,
            engine,
            output_mode: request.output_mode.unwrap_or(self.config.default_output_mode),
            dispatch: request.dispatch,
            project: request.project,
            parent_task_id: request.parent_task_id,
            created_at: Utc::now().timestamp_millis(),
            history: Vec::new(),
            last_listing: listing,
        };
        let rendered = render_listing(&session);

        match self.registry.start_browsing(session) {
            Ok(previous) => {
                if previous.is_some() {
                    debug!(thread = %key.thread_id, "Replaced earlier browsing session");
                }
                info!(thread = %key.thread_id, machine = %machine.name, "Browsing started");
                self.say(&key, rendered).await
            }
            Err(e) => self.say(&key, format!("⚠️ {}", e)).await,
        }
    }

    /// Act on a reply sent while the thread is browsing
    pub async fn handle_browse_input(&self, key: &ChatKey, text: &str) -> Result<()> {
        let Some(mut session) = self.registry.browsing(&key.thread_id) else {
            return self
                .say(key, "⌛ This browsing session has expired. Start a new one.")
                .await;
        };

        match parse_input(text, &session) {
            NavAction::Start => self.start_from_browsing(key).await,
            NavAction::Error(message) => {
                self.registry.update_browsing(session);
                self.say(key, format!("❌ {}", message)).await
            }
            NavAction::Navigate(path) => {
                let machine = match self.machines.get(&session.machine) {
                    Ok(m) => m.clone(),
                    Err(e) => return self.say(key, format!("❌ {}", e)).await,
                };
                match self.list_directory(&machine, &path).await {
                    Ok(listing) => {
                        session.navigate_to(path, listing);
                        let rendered = render_listing(&session);
                        if self.registry.update_browsing(session) {
                            self.say(key, rendered).await
                        } else {
                            self.say(key, "⌛ This browsing session ended while listing.").await
                        }
                    }
                    Err(message) => {
                        // Keep the session so the user can pick again
                        self.registry.update_browsing(session);
                        self.say(key, format!("❌ {}", message)).await
                    }
                }
            }
        }
    }

    pub async fn cancel_browsing(&self, key: &ChatKey) -> Result<()> {
        match self.registry.cancel_browsing(&key.thread_id) {
            Some(_) => {
                info!(thread = %key.thread_id, "Browsing cancelled");
                self.say(key, "🚫 Browsing cancelled.").await
            }
            None => self.say(key, "Nothing to cancel in this thread.").await,
        }
    }

    /// Run a directory listing. `Err` carries a user-facing message.
    async fn list_directory(&self, machine: &Machine, path: &str) -> std::result::Result<Vec<String>, String> {
        let command = listing_command(path, machine.os);
        let output = self
            .transport
            .exec(machine, &command, self.config.exec_timeout())
            .await
            .map_err(|e| {
                warn!(machine = %machine.name, path = %path, error = %e, "Directory listing failed");
                format!("Could not list {} on {}: {}", path, machine.name, e)
            })?;

        if output.success {
            return Ok(parse_listing(&output.stdout));
        }
        if output.code == Some(LISTING_NO_DIR_EXIT) {
            return Err(format!("No such directory on {}: {}", machine.name, path));
        }
        let detail = last_lines(output.stderr.trim(), 3);
        warn!(machine = %machine.name, path = %path, code = ?output.code, "Directory listing exited with error");
        Err(if detail.is_empty() {
            format!("Could not list {} on {}", path, machine.name)
        } else {
            format!("Could not list {} on {}: {}", path, machine.name, detail)
        })
    }

    // ============ Starting ============

    /// Consume the browsing session and start it, inline or queued
    pub async fn start_from_browsing(&self, key: &ChatKey) -> Result<()> {
        let session = match self.registry.enter_spawning(&key.thread_id) {
            Ok(Some(session)) => session,
            Ok(None) => {
                return self
                    .say(key, "⌛ No browsing session in this thread. Start a new one.")
                    .await;
            }
            Err(e) => return self.say(key, format!("⚠️ {}", e)).await,
        };

        match session.dispatch {
            DispatchMode::Inline => self.spawn_session(key, session).await,
            DispatchMode::Queued => self.submit_queued(key, session).await,
        }
    }

    async fn submit_queued(&self, key: &ChatKey, session: BrowsingSession) -> Result<()> {
        let request = TaskRequest {
            machine: session.machine.clone(),
            path: session.current_path.clone(),
            prompt: session.prompt.clone(),
            engine: session.engine.clone(),
            project: session.project_name(),
            parent_task_id: session.parent_task_id.clone(),
            chat_id: key.chat_id.clone(),
            thread_id: key.thread_id.clone(),
        };
        let result = self.queue.submit(request).await;
        self.registry.exit_spawning(&key.thread_id);

        match result {
            Ok(task_id) => {
                info!(thread = %key.thread_id, task_id = %task_id, "Browsing session dispatched to queue");
                self.say(
                    key,
                    format!(
                        "📋 Queued as task {} on {}:{}",
                        task_id, session.machine, session.current_path
                    ),
                )
                .await
            }
            Err(e) => {
                warn!(thread = %key.thread_id, error = %e, "Queue submission failed");
                self.say(key, format!("❌ Could not queue the task: {}", e)).await
            }
        }
    }

    /// Connect, wait for readiness and install the active session. The
    /// thread must already be marked spawning.
    async fn spawn_session(&self, key: &ChatKey, session: BrowsingSession) -> Result<()> {
        let thread_id = key.thread_id.clone();
        let machine = match self.machines.get(&session.machine) {
            Ok(m) => m.clone(),
            Err(e) => return self.fail_spawn(key, &session.machine, &e.to_string()).await,
        };
        let template = match self.config.engine(Some(&session.engine)) {
            Ok((_, template)) => template,
            Err(e) => return self.fail_spawn(key, &machine.name, &e.to_string()).await,
        };

        let invocation = engine_invocation(&template, &session.prompt, session.output_mode, machine.os);
        let spec = SpawnSpec {
            command: session_command(&session.current_path, &invocation.command, machine.os),
            pty: session.output_mode == OutputMode::RawTerminal,
        };
        let session_id = new_session_id();

        info!(
            thread = %thread_id,
            session = %session_id,
            machine = %machine.name,
            path = %session.current_path,
            engine = %session.engine,
            "Starting session"
        );
        if let Err(e) = self
            .say(
                key,
                format!(
                    "🚀 Starting {} on {}:{} ...",
                    session.engine, machine.name, session.current_path
                ),
            )
            .await
        {
            self.registry.exit_spawning(&thread_id);
            return Err(e);
        }

        let spawn_timeout = self.config.spawn_timeout();
        let connected = match timeout(spawn_timeout, self.connect(&machine, spec)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return self.fail_spawn(key, &machine.name, &e.to_string()).await,
            Err(_) => {
                let e = BridgeError::SpawnTimeout(spawn_timeout);
                return self.fail_spawn(key, &machine.name, &e.to_string()).await;
            }
        };
        let (mut handle, output, early) = connected;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let started_at = Utc::now().timestamp_millis();
        let entry = ActiveEntry {
            session_id: session_id.clone(),
            chat_id: key.chat_id.clone(),
            machine: machine.name.clone(),
            path: session.current_path.clone(),
            engine: session.engine.clone(),
            output_mode: session.output_mode,
            started_at,
            commands: commands_tx,
        };
        if let Err(e) = self.registry.set_active(&thread_id, entry) {
            handle.close();
            return self.fail_spawn(key, &machine.name, &e.to_string()).await;
        }

        let announced = self
            .say(
                key,
                format!(
                    "✅ Session {} started. Messages here go to {}; /close ends it.",
                    short_id(&session_id),
                    session.engine
                ),
            )
            .await;
        if let Err(e) = announced {
            warn!(thread = %thread_id, session = %session_id, error = %e, "Could not announce session, closing it");
            handle.close();
            self.registry.close_active(&thread_id, &session_id);
            return Err(e);
        }

        let info = SessionInfo {
            session_id,
            key: key.clone(),
            machine: machine.name.clone(),
            path: session.current_path.clone(),
            engine: session.engine.clone(),
            project: session.project_name(),
            parent_task_id: session.parent_task_id.clone(),
            output_mode: session.output_mode,
            started_at,
        };
        let limits = SessionLimits {
            idle_timeout: self.config.idle_timeout(),
            hard_timeout: self.config.hard_timeout(),
            max_message_len: self.config.max_message_len,
        };
        let active = ActiveSession::new(
            info,
            limits,
            handle,
            Arc::clone(&self.registry),
            Arc::clone(&self.chat),
            Arc::clone(&self.analyzer),
        );
        tokio::spawn(active.run(output, commands_rx, early, invocation.initial_input));
        Ok(())
    }

    /// Spawn the remote process, wait for the ready marker, then watch the
    /// grace window for an immediate exit
    async fn connect(
        &self,
        machine: &Machine,
        spec: SpawnSpec,
    ) -> Result<(RemoteHandle, mpsc::Receiver<Vec<u8>>, Vec<u8>)> {
        let mut handle = self.transport.spawn_interactive(machine, spec).await?;
        let mut early = handle.wait_for_marker(READY_MARKER).await?;
        let mut output = handle
            .take_output()
            .ok_or_else(|| BridgeError::Transport("output stream unavailable".to_string()))?;

        let deadline = Instant::now() + STARTUP_GRACE;
        loop {
            match timeout_at(deadline, output.recv()).await {
                Ok(Some(chunk)) => early.extend_from_slice(&chunk),
                Ok(None) => {
                    let text = String::from_utf8_lossy(&early);
                    let tail = last_lines(text.trim(), 5);
                    let detail = if tail.is_empty() {
                        "the remote process exited right after starting".to_string()
                    } else {
                        tail
                    };
                    return Err(BridgeError::Transport(detail).into());
                }
                Err(_) => break,
            }
        }
        Ok((handle, output, early))
    }

    async fn fail_spawn(&self, key: &ChatKey, machine: &str, reason: &str) -> Result<()> {
        self.registry.exit_spawning(&key.thread_id);
        warn!(thread = %key.thread_id, machine = %machine, reason = %reason, "Session start failed");
        self.say(key, format!("❌ Failed to start session on {}: {}", machine, reason))
            .await
    }

    // ============ Active session ============

    /// Relay a chat message to the running session
    pub async fn forward_input(&self, key: &ChatKey, text: &str) -> Result<()> {
        self.send_command(key, SessionCommand::Input(text.to_string())).await
    }

    /// Send Ctrl+C to the running session
    pub async fn interrupt(&self, key: &ChatKey) -> Result<()> {
        self.send_command(key, SessionCommand::Interrupt).await
    }

    async fn send_command(&self, key: &ChatKey, command: SessionCommand) -> Result<()> {
        let Some(entry) = self.registry.active(&key.thread_id) else {
            let e = BridgeError::NotActive(key.thread_id.clone());
            return self.say(key, format!("⚠️ {}", e)).await;
        };
        if entry.commands.send(command).is_err() {
            debug!(thread = %key.thread_id, session = %entry.session_id, "Session task already gone");
            return self.say(key, "⚠️ The session is no longer running.").await;
        }
        Ok(())
    }

    /// Current session summary, if a session is running
    pub async fn status(&self, thread_id: &str) -> Option<SessionStatus> {
        let entry = self.registry.active(thread_id)?;
        let (tx, rx) = oneshot::channel();
        entry.commands.send(SessionCommand::Status(tx)).ok()?;
        timeout(STATUS_WAIT, rx).await.ok()?.ok()
    }

    pub async fn report_status(&self, key: &ChatKey) -> Result<()> {
        if let Some(status) = self.status(&key.thread_id).await {
            return self.say(key, status.render()).await;
        }
        let text = match self.registry.classify(&key.thread_id) {
            ThreadState::Browsing => match self.registry.browsing(&key.thread_id) {
                Some(b) => format!("📂 Browsing {}:{}", b.machine, b.current_path),
                None => "No session in this thread.".to_string(),
            },
            ThreadState::Spawning => "⏳ The session is still starting.".to_string(),
            _ => "No session in this thread.".to_string(),
        };
        self.say(key, text).await
    }

    /// Close whatever the thread owns: the active session, else browsing
    pub async fn close(&self, key: &ChatKey, reason: CloseReason) -> Result<()> {
        let Some(entry) = self.registry.active(&key.thread_id) else {
            return match self.registry.classify(&key.thread_id) {
                ThreadState::Browsing => self.cancel_browsing(key).await,
                ThreadState::Spawning => self.say(key, "⏳ The session is still starting.").await,
                _ => self.say(key, "No active session in this thread.").await,
            };
        };

        let (done_tx, done_rx) = oneshot::channel();
        let command = SessionCommand::Close {
            reason,
            done: Some(done_tx),
        };
        if entry.commands.send(command).is_err() {
            // The task is gone without cleaning up; finish the transition here
            if self
                .registry
                .close_active(&key.thread_id, &entry.session_id)
                .is_some()
            {
                warn!(thread = %key.thread_id, session = %entry.session_id, "Closed orphaned session entry");
                return self.say(key, "🔚 Session closed.").await;
            }
            return Ok(());
        }

        if timeout(CLOSE_WAIT, done_rx).await.is_err() {
            warn!(thread = %key.thread_id, session = %entry.session_id, "Session did not confirm close in time");
        }
        Ok(())
    }

    /// Close every running session through the normal close path
    pub async fn shutdown_all(&self) {
        let sessions = self.registry.active_sessions();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing all sessions");

        let mut pending = Vec::new();
        for (thread_id, entry) in sessions {
            let (done_tx, done_rx) = oneshot::channel();
            let command = SessionCommand::Close {
                reason: CloseReason::Shutdown,
                done: Some(done_tx),
            };
            if entry.commands.send(command).is_ok() {
                pending.push((thread_id, done_rx));
            } else {
                self.registry.close_active(&thread_id, &entry.session_id);
            }
        }

        let deadline = Instant::now() + CLOSE_WAIT;
        for (thread_id, done_rx) in pending {
            if timeout_at(deadline, done_rx).await.is_err() {
                warn!(thread = %thread_id, "Session did not close before shutdown deadline");
            }
        }
    }
}

fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("rs-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}
