//! Active session loop
//!
//! One task per running session. It exclusively owns the [`RemoteHandle`],
//! turns output into chat messages, writes relayed input, and performs the
//! close sequence exactly once, whatever triggered it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use relayd_runner::{user_input_line, Decoded, LineDecoder, StreamEvent};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::question::{answer_keys, detect_question};
use crate::chat::{deliver, ChatSink, OutgoingMessage};
use crate::error::BridgeError;
use crate::registry::SessionRegistry;
use crate::ssh::RemoteHandle;
use crate::terminal::{sanitize, LineAssembler, RedrawFilter};
use crate::transcript::{submit_detached, Transcript, TranscriptAnalyzer, TranscriptContext, TranscriptEntry};
use crate::types::{ChatKey, OutputMode};

/// Quiet period after which a carried partial line is delivered
const PARTIAL_FLUSH_AFTER: Duration = Duration::from_millis(800);

/// Pause between a bracketed paste and the Enter that submits it
const PASTE_SETTLE: Duration = Duration::from_millis(500);

const CTRL_C: &str = "\x03";
const ENTER: &str = "\r";

static RATE_LIMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rate.?limit|usage limit|\b429\b|overloaded").unwrap());

static ENGINE_SWITCH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:model set to|set model to|switched to model)\s+([\w.:\-/]+)").unwrap());

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    UserRequested,
    IdleTimeout,
    HardTimeout,
    ProcessExited,
    TransportError(String),
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::UserRequested => "user_requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::HardTimeout => "hard_timeout",
            CloseReason::ProcessExited => "process_exited",
            CloseReason::TransportError(_) => "transport_error",
            CloseReason::Shutdown => "shutdown",
        }
    }

    fn describe(&self) -> String {
        match self {
            CloseReason::UserRequested => "closed".to_string(),
            CloseReason::IdleTimeout => "closed after being idle too long".to_string(),
            CloseReason::HardTimeout => "closed after reaching its time limit".to_string(),
            CloseReason::ProcessExited => "ended: the remote process exited".to_string(),
            CloseReason::TransportError(e) => format!("ended on a connection error: {}", e),
            CloseReason::Shutdown => "closed because the bridge is shutting down".to_string(),
        }
    }
}

/// Messages from the relay and controller to the session task
#[derive(Debug)]
pub enum SessionCommand {
    Input(String),
    Interrupt,
    Close {
        reason: CloseReason,
        done: Option<oneshot::Sender<()>>,
    },
    Status(oneshot::Sender<SessionStatus>),
}

/// Point-in-time summary of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub machine: String,
    pub path: String,
    pub engine: String,
    pub sub_engine: Option<String>,
    pub output_mode: OutputMode,
    pub started_at: i64,
    pub duration_secs: u64,
    pub turns: u32,
    pub rate_limit_hits: u32,
    pub last_rate_limit_check: Option<i64>,
    pub transcript_entries: usize,
}

impl SessionStatus {
    pub fn render(&self) -> String {
        let mut out = format!(
            "📊 Session {}\nMachine: {}\nPath: {}\nEngine: {}",
            short_id(&self.session_id),
            self.machine,
            self.path,
            self.engine
        );
        if let Some(ref sub) = self.sub_engine {
            out.push_str(&format!(" ({})", sub));
        }
        out.push_str(&format!(
            "\nRunning: {}\nTurns: {}\nRate limits: {}",
            format_duration(self.duration_secs),
            self.turns,
            self.rate_limit_hits
        ));
        out
    }
}

pub(crate) fn short_id(session_id: &str) -> &str {
    session_id.rsplit('-').next().unwrap_or(session_id)
}

pub(crate) fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Fixed facts about a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub key: ChatKey,
    pub machine: String,
    pub path: String,
    pub engine: String,
    pub project: String,
    pub parent_task_id: Option<String>,
    pub output_mode: OutputMode,
    pub started_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub idle_timeout: Duration,
    pub hard_timeout: Option<Duration>,
    pub max_message_len: usize,
}

pub(crate) struct ActiveSession {
    info: SessionInfo,
    limits: SessionLimits,
    handle: RemoteHandle,
    registry: Arc<SessionRegistry>,
    chat: Arc<dyn ChatSink>,
    analyzer: Arc<dyn TranscriptAnalyzer>,
    transcript: Transcript,
    turns: u32,
    rate_limit_hits: u32,
    last_rate_limit_check: Option<i64>,
    sub_engine: Option<String>,
    assembler: LineAssembler,
    redraw: RedrawFilter,
    decoder: LineDecoder,
    started: Instant,
}

impl ActiveSession {
    pub(crate) fn new(
        info: SessionInfo,
        limits: SessionLimits,
        handle: RemoteHandle,
        registry: Arc<SessionRegistry>,
        chat: Arc<dyn ChatSink>,
        analyzer: Arc<dyn TranscriptAnalyzer>,
    ) -> Self {
        Self {
            info,
            limits,
            handle,
            registry,
            chat,
            analyzer,
            transcript: Transcript::new(),
            turns: 0,
            rate_limit_hits: 0,
            last_rate_limit_check: None,
            sub_engine: None,
            assembler: LineAssembler::new(),
            redraw: RedrawFilter::default(),
            decoder: LineDecoder::new(),
            started: Instant::now(),
        }
    }

    /// Drive the session until it closes. `early` is output that arrived
    /// during the readiness check.
    pub(crate) async fn run(
        mut self,
        mut output: mpsc::Receiver<Vec<u8>>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        early: Vec<u8>,
        initial_input: Option<String>,
    ) {
        info!(session = %self.info.session_id, thread = %self.info.key.thread_id, "Session loop started");

        if !early.is_empty() {
            self.on_output(&early).await;
        }
        if let Some(prompt) = initial_input {
            if let Err(e) = self.send_input(prompt).await {
                self.finish(CloseReason::TransportError(e.to_string()), None).await;
                return;
            }
        }

        let mut idle_deadline = Instant::now() + self.limits.idle_timeout;
        let hard_deadline = self.limits.hard_timeout.map(|d| self.started + d);
        let mut flush_deadline: Option<Instant> = self.partial_deadline();
        let mut done: Option<oneshot::Sender<()>> = None;

        let reason = loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(bytes) => {
                        self.on_output(&bytes).await;
                        idle_deadline = Instant::now() + self.limits.idle_timeout;
                        flush_deadline = self.partial_deadline();
                    }
                    None => {
                        self.flush_partial().await;
                        break CloseReason::ProcessExited;
                    }
                },
                command = commands.recv() => match command {
                    Some(SessionCommand::Input(text)) => {
                        idle_deadline = Instant::now() + self.limits.idle_timeout;
                        if let Err(e) = self.send_input(text).await {
                            break CloseReason::TransportError(e.to_string());
                        }
                    }
                    Some(SessionCommand::Interrupt) => {
                        if let Err(e) = self.handle.write(CTRL_C) {
                            break CloseReason::TransportError(e.to_string());
                        }
                    }
                    Some(SessionCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(SessionCommand::Close { reason, done: ack }) => {
                        done = ack;
                        break reason;
                    }
                    None => break CloseReason::Shutdown,
                },
                _ = sleep_until(idle_deadline) => break CloseReason::IdleTimeout,
                _ = sleep_until_opt(hard_deadline) => break CloseReason::HardTimeout,
                _ = sleep_until_opt(flush_deadline) => {
                    self.flush_partial().await;
                    flush_deadline = None;
                }
            }
        };

        self.finish(reason, done).await;
    }

    fn partial_deadline(&self) -> Option<Instant> {
        let carrying = match self.info.output_mode {
            OutputMode::RawTerminal => self.assembler.has_partial(),
            OutputMode::StreamJson => false,
        };
        carrying.then(|| Instant::now() + PARTIAL_FLUSH_AFTER)
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.info.session_id.clone(),
            machine: self.info.machine.clone(),
            path: self.info.path.clone(),
            engine: self.info.engine.clone(),
            sub_engine: self.sub_engine.clone(),
            output_mode: self.info.output_mode,
            started_at: self.info.started_at,
            duration_secs: self.started.elapsed().as_secs(),
            turns: self.turns,
            rate_limit_hits: self.rate_limit_hits,
            last_rate_limit_check: self.last_rate_limit_check,
            transcript_entries: self.transcript.len(),
        }
    }

    // ---------- output ----------

    async fn on_output(&mut self, bytes: &[u8]) {
        match self.info.output_mode {
            OutputMode::RawTerminal => {
                if let Some(text) = self.assembler.push(bytes) {
                    self.deliver_terminal_text(&text).await;
                }
            }
            OutputMode::StreamJson => {
                for decoded in self.decoder.push(bytes) {
                    self.on_decoded(decoded).await;
                }
            }
        }
    }

    async fn flush_partial(&mut self) {
        match self.info.output_mode {
            OutputMode::RawTerminal => {
                if let Some(text) = self.assembler.flush() {
                    self.deliver_terminal_text(&text).await;
                }
            }
            OutputMode::StreamJson => {
                if let Some(decoded) = self.decoder.finish() {
                    self.on_decoded(decoded).await;
                }
            }
        }
    }

    async fn deliver_terminal_text(&mut self, raw: &str) {
        let lines = self.redraw.filter(sanitize(&[raw]));
        let lines = trim_blank_edges(lines);
        if lines.is_empty() {
            return;
        }
        for line in &lines {
            self.observe_line(line);
        }
        if let Some(question) = detect_question(&lines) {
            debug!(thread = %self.info.key.thread_id, prompt = %question.prompt, "Pending question");
            self.registry.set_pending_question(&self.info.key.thread_id, question);
        }
        let text = lines.join("\n");
        self.transcript.push(TranscriptEntry::text(text.clone()));
        self.send_text(&text).await;
    }

    async fn on_decoded(&mut self, decoded: Decoded) {
        match decoded {
            Decoded::Event(StreamEvent::System(event)) => {
                if let Some(model) = event.model {
                    self.set_sub_engine(model);
                }
            }
            Decoded::Event(StreamEvent::Assistant(event)) => {
                if let Some(ref model) = event.message.model {
                    self.set_sub_engine(model.clone());
                }
                let mut parts = Vec::new();
                let text = event.message.text();
                if !text.trim().is_empty() {
                    for line in text.lines() {
                        self.observe_line(line);
                    }
                    self.transcript.push(TranscriptEntry::text(text.clone()));
                    parts.push(text);
                }
                for tool in event.message.tool_uses() {
                    let file = tool.file_path().map(str::to_string);
                    parts.push(match file {
                        Some(ref f) => format!("🔧 {} {}", tool.name, f),
                        None => format!("🔧 {}", tool.name),
                    });
                    self.transcript.push(TranscriptEntry::tool_use(tool.name, file));
                }
                if !parts.is_empty() {
                    self.send_text(&parts.join("\n")).await;
                }
            }
            Decoded::Event(StreamEvent::Result(result)) => {
                self.observe_line(&result.result);
                self.transcript
                    .push(TranscriptEntry::result(result.result.clone(), result.is_error));
                if result.is_error {
                    self.send_text(&format!("⚠️ {}", result.result.trim())).await;
                }
            }
            Decoded::Event(StreamEvent::User(_)) | Decoded::Unknown(_) => {}
            Decoded::Noise(line) => {
                self.observe_line(&line);
                debug!(thread = %self.info.key.thread_id, line = %line, "Non-event output");
            }
        }
    }

    fn observe_line(&mut self, line: &str) {
        if RATE_LIMIT_PATTERN.is_match(line) {
            self.rate_limit_hits += 1;
            self.last_rate_limit_check = Some(Utc::now().timestamp_millis());
            warn!(session = %self.info.session_id, hits = self.rate_limit_hits, "Rate limit signal");
        }
        if let Some(caps) = ENGINE_SWITCH_PATTERN.captures(line) {
            self.set_sub_engine(caps[1].to_string());
        }
    }

    fn set_sub_engine(&mut self, engine: String) {
        if self.sub_engine.as_deref() != Some(engine.as_str()) {
            info!(session = %self.info.session_id, engine = %engine, "Engine changed");
            self.sub_engine = Some(engine);
        }
    }

    async fn send_text(&mut self, text: &str) {
        if let Err(e) = deliver(self.chat.as_ref(), &self.info.key, text, self.limits.max_message_len).await {
            warn!(thread = %self.info.key.thread_id, error = %e, "Failed to deliver output");
        }
    }

    // ---------- input ----------

    async fn send_input(&mut self, text: String) -> Result<(), BridgeError> {
        self.turns += 1;
        self.transcript.push(TranscriptEntry::user_input(text.clone()));

        match self.info.output_mode {
            OutputMode::StreamJson => self.handle.write(user_input_line(&text)),
            OutputMode::RawTerminal => {
                // A new turn may legitimately repeat an earlier answer
                self.redraw.clear();
                let question = self.registry.take_pending_question(&self.info.key.thread_id);
                if let Some(keys) = question.as_ref().and_then(|q| answer_keys(q, &text)) {
                    debug!(thread = %self.info.key.thread_id, "Answering pending question");
                    return self.handle.write(keys);
                }
                // Bracketed paste keeps multi-line input as one message
                self.handle.write(format!("\x1b[200~{}\x1b[201~", text))?;
                tokio::time::sleep(PASTE_SETTLE).await;
                self.handle.write(ENTER)
            }
        }
    }

    // ---------- close ----------

    async fn finish(mut self, reason: CloseReason, done: Option<oneshot::Sender<()>>) {
        let thread_id = self.info.key.thread_id.clone();

        self.handle.close();
        let was_current = self
            .registry
            .close_active(&thread_id, &self.info.session_id)
            .is_some();

        let duration_secs = self.started.elapsed().as_secs();
        info!(
            session = %self.info.session_id,
            thread = %thread_id,
            reason = reason.as_str(),
            turns = self.turns,
            duration_secs,
            "Session closed"
        );

        if was_current {
            let notice = format!(
                "🔚 Session {} {}. {} turns in {}.",
                short_id(&self.info.session_id),
                reason.describe(),
                self.turns,
                format_duration(duration_secs)
            );
            if let Err(e) = self.chat.send(OutgoingMessage::text(&self.info.key, notice)).await {
                warn!(thread = %thread_id, error = %e, "Failed to send close notice");
            }
        }

        let context = TranscriptContext {
            session_id: self.info.session_id.clone(),
            thread_id,
            project: self.info.project.clone(),
            task_id: self.info.parent_task_id.clone(),
            machine: self.info.machine.clone(),
            path: self.info.path.clone(),
            engine: self.info.engine.clone(),
            sub_engine: self.sub_engine.clone(),
            outcome: reason.as_str().to_string(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            turns: self.turns,
            rate_limit_hits: self.rate_limit_hits,
        };
        let transcript = std::mem::take(&mut self.transcript);
        submit_detached(Arc::clone(&self.analyzer), transcript, context);

        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn trim_blank_edges(mut lines: Vec<String>) -> Vec<String> {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let leading = lines.iter().take_while(|l| l.trim().is_empty()).count();
    lines.drain(..leading);
    lines
}
