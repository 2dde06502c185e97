//! In-process fakes for the chat and SSH seams

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::browse::{listing_command, LISTING_NO_DIR_EXIT};
use crate::chat::{ChatSink, OutgoingMessage};
use crate::config::BridgeConfig;
use crate::lifecycle::READY_MARKER;
use crate::queue::{TaskQueue, TaskRequest};
use crate::ssh::{ExecOutput, ProcessControl, RemoteHandle, RemoteTransport, SpawnSpec};
use crate::transcript::{Transcript, TranscriptAnalyzer, TranscriptContext};
use crate::types::{Machine, MachineRegistry, TargetOs};

pub(crate) fn machine(name: &str) -> Machine {
    Machine {
        name: name.to_string(),
        host: format!("{}.lan", name),
        user: "dev".to_string(),
        port: 22,
        os: TargetOs::Posix,
        identity_file: None,
        description: None,
    }
}

pub(crate) fn machines() -> MachineRegistry {
    MachineRegistry::from_machines(vec![machine("buildbox")])
}

pub(crate) fn config() -> BridgeConfig {
    BridgeConfig::default()
}

// ============ Chat ============

#[derive(Default)]
pub(crate) struct RecordingChatSink {
    sent: Mutex<Vec<OutgoingMessage>>,
    /// Sends whose text starts with this prefix fail
    fail_prefix: Option<String>,
}

impl RecordingChatSink {
    pub(crate) fn failing_on(prefix: &str) -> Self {
        Self {
            sent: Mutex::default(),
            fail_prefix: Some(prefix.to_string()),
        }
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }

    pub(crate) fn messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn last(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|m| m.text.clone())
    }

    /// Poll until `done` holds for the sent texts, at most `limit` of
    /// (paused) tokio time
    pub(crate) async fn wait_until(&self, limit: Duration, done: impl Fn(&[String]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if done(&self.texts()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl ChatSink for RecordingChatSink {
    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        if let Some(ref prefix) = self.fail_prefix {
            if message.text.starts_with(prefix.as_str()) {
                return Err(anyhow!("chat transport unavailable"));
            }
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

// ============ SSH ============

/// How a fake interactive spawn behaves
#[derive(Debug, Clone)]
pub(crate) enum SpawnBehavior {
    /// Print the ready marker, then these chunks; the process stays up
    /// until terminated
    Ready(Vec<Vec<u8>>),
    /// Print the ready marker and these chunks, then exit
    ExitAfter(Vec<Vec<u8>>),
    /// Never return, like a connect to an unreachable host
    Hang,
    Fail(String),
}

type Senders = Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>;

struct FakeControl {
    outputs: Senders,
    terminated: Arc<Mutex<usize>>,
}

impl ProcessControl for FakeControl {
    fn terminate(&mut self) {
        self.outputs.lock().unwrap().clear();
        *self.terminated.lock().unwrap() += 1;
    }
}

pub(crate) struct FakeTransport {
    listings: Mutex<HashMap<String, Vec<String>>>,
    spawn: Mutex<SpawnBehavior>,
    pub(crate) spawned: Mutex<Vec<SpawnSpec>>,
    pub(crate) input: Arc<Mutex<Vec<String>>>,
    pub(crate) terminated: Arc<Mutex<usize>>,
    /// Output senders of processes still running
    outputs: Senders,
}

impl FakeTransport {
    pub(crate) fn new(spawn: SpawnBehavior) -> Self {
        Self {
            listings: Mutex::new(HashMap::new()),
            spawn: Mutex::new(spawn),
            spawned: Mutex::new(Vec::new()),
            input: Arc::new(Mutex::new(Vec::new())),
            terminated: Arc::new(Mutex::new(0)),
            outputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_listing(self, path: &str, entries: &[&str]) -> Self {
        self.listings.lock().unwrap().insert(
            path.to_string(),
            entries.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    pub(crate) fn input_text(&self) -> String {
        self.input.lock().unwrap().concat()
    }

    pub(crate) fn terminations(&self) -> usize {
        *self.terminated.lock().unwrap()
    }

    /// Emit output on the most recently spawned process
    pub(crate) async fn emit(&self, bytes: &[u8]) {
        let sender = self.outputs.lock().unwrap().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(bytes.to_vec()).await;
        }
    }

    /// Make every running process exit
    pub(crate) fn exit_all(&self) {
        self.outputs.lock().unwrap().clear();
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(&self, _machine: &Machine, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        let listings = self.listings.lock().unwrap().clone();
        for (path, entries) in listings {
            if listing_command(&path, TargetOs::Posix) == command {
                return Ok(ExecOutput {
                    success: true,
                    code: Some(0),
                    stdout: entries.join("\n"),
                    stderr: String::new(),
                });
            }
        }
        Ok(ExecOutput {
            success: false,
            code: Some(LISTING_NO_DIR_EXIT),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn spawn_interactive(&self, _machine: &Machine, spec: SpawnSpec) -> Result<RemoteHandle> {
        self.spawned.lock().unwrap().push(spec);
        let behavior = self.spawn.lock().unwrap().clone();
        let (chunks, stay_open) = match behavior {
            SpawnBehavior::Ready(chunks) => (chunks, true),
            SpawnBehavior::ExitAfter(chunks) => (chunks, false),
            SpawnBehavior::Hang => std::future::pending().await,
            SpawnBehavior::Fail(message) => return Err(anyhow!(message)),
        };

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (output_tx, output_rx) = mpsc::channel(256);

        let _ = output_tx.try_send(format!("{}\r\n", READY_MARKER).into_bytes());
        for chunk in chunks {
            let _ = output_tx.try_send(chunk);
        }

        let recorded = Arc::clone(&self.input);
        tokio::spawn(async move {
            while let Some(bytes) = input_rx.recv().await {
                recorded
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&bytes).into_owned());
            }
        });

        if stay_open {
            self.outputs.lock().unwrap().push(output_tx);
        }
        let control = FakeControl {
            outputs: Arc::clone(&self.outputs),
            terminated: Arc::clone(&self.terminated),
        };
        Ok(RemoteHandle::new(input_tx, output_rx, Box::new(control)))
    }
}

// ============ Collaborators ============

#[derive(Default)]
pub(crate) struct RecordingAnalyzer {
    pub(crate) received: Mutex<Vec<(Transcript, TranscriptContext)>>,
}

#[async_trait]
impl TranscriptAnalyzer for RecordingAnalyzer {
    async fn analyze(&self, transcript: Transcript, context: TranscriptContext) -> Result<()> {
        self.received.lock().unwrap().push((transcript, context));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingQueue {
    pub(crate) submitted: Mutex<Vec<TaskRequest>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn submit(&self, request: TaskRequest) -> Result<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request);
        Ok(format!("task-{}", submitted.len()))
    }
}
