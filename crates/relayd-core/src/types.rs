//! Core types for relayd

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

// ============ Threads ============

/// A chat thread, qualified by the chat it lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatKey {
    pub chat_id: String,
    pub thread_id: String,
}

impl ChatKey {
    pub fn new(chat_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// Ownership state of a thread, as seen by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    /// Not owned by the bridge
    None,
    /// Directory browsing in progress
    Browsing,
    /// Remote process is being started
    Spawning,
    /// Remote process is running
    Active,
    /// A session ended within the recently-closed window
    RecentlyClosed,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadState::None => "none",
            ThreadState::Browsing => "browsing",
            ThreadState::Spawning => "spawning",
            ThreadState::Active => "active",
            ThreadState::RecentlyClosed => "recently_closed",
        }
    }

    /// Whether inbound messages for the thread belong to the bridge
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            ThreadState::Browsing | ThreadState::Spawning | ThreadState::Active
        )
    }
}

// ============ Sessions ============

/// How the remote tool's output is consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Full-screen TUI under a PTY, sanitized line by line
    #[default]
    RawTerminal,
    /// `--output-format stream-json` event lines
    StreamJson,
}

/// Whether a started session runs inline or is handed to the task queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Inline,
    Queued,
}

// ============ Machines ============

/// Remote operating system family; decides shell quoting and listing commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    #[default]
    Posix,
    Windows,
}

/// A machine reachable over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub os: TargetOs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Machine {
    /// `user@host` destination for ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Connection arguments shared by one-shot and interactive ssh calls
    pub fn ssh_args(&self, connect_timeout_secs: u64) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(ref identity) = self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.destination());
        args
    }
}

/// Machine registry (loaded from machines.yaml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineRegistry {
    #[serde(default)]
    pub machines: Vec<Machine>,
}

impl MachineRegistry {
    /// Load from YAML file, returns an empty registry if the file doesn't exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let registry: Self = serde_yaml::from_str(&content)?;
        Ok(registry)
    }

    pub fn from_machines(machines: Vec<Machine>) -> Self {
        Self { machines }
    }

    /// Get machine by name (case-insensitive)
    pub fn get(&self, name: &str) -> Result<&Machine, BridgeError> {
        self.machines
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| BridgeError::UnknownMachine(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.name.clone()).collect()
    }
}
