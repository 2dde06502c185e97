//! Bridge configuration
//!
//! `relayd.yaml` under the relayd home directory. Every field has a default,
//! so a missing file yields a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::OutputMode;

/// Placeholder replaced by the shell-quoted prompt in engine templates
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Relayd home: `RELAYD_HOME` or `~/.relayd`
pub fn default_home() -> PathBuf {
    if let Some(home) = env_path("RELAYD_HOME") {
        return home;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relayd")
}

pub fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// `RELAYD_CONFIG` or `<home>/relayd.yaml`
pub fn config_path(home: &Path) -> PathBuf {
    env_path("RELAYD_CONFIG").unwrap_or_else(|| home.join("relayd.yaml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub max_message_len: usize,
    pub spawn_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub hard_timeout_secs: Option<u64>,
    pub browse_ttl_secs: u64,
    pub spawning_ttl_secs: u64,
    pub recently_closed_ttl_secs: u64,
    pub suppress_ttl_secs: u64,
    pub flow_ttl_secs: u64,
    pub exec_timeout_ms: u64,
    /// Engine name -> remote command template
    pub engines: HashMap<String, String>,
    pub default_engine: String,
    pub default_output_mode: OutputMode,
    pub analysis_url: Option<String>,
    pub queue_url: Option<String>,
    pub machines_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut engines = HashMap::new();
        engines.insert("claude".to_string(), "claude".to_string());
        Self {
            max_message_len: 4096,
            spawn_timeout_secs: 60,
            idle_timeout_secs: 1800,
            hard_timeout_secs: None,
            browse_ttl_secs: 300,
            spawning_ttl_secs: 60,
            recently_closed_ttl_secs: 30,
            suppress_ttl_secs: 60,
            flow_ttl_secs: 300,
            exec_timeout_ms: 15_000,
            engines,
            default_engine: "claude".to_string(),
            default_output_mode: OutputMode::RawTerminal,
            analysis_url: None,
            queue_url: None,
            machines_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load from YAML, falling back to defaults when the file doesn't exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// `RELAYD_MACHINES`, then `machinesPath`, then `<home>/machines.yaml`
    pub fn machines_path(&self, home: &Path) -> PathBuf {
        env_path("RELAYD_MACHINES")
            .or_else(|| self.machines_path.clone())
            .unwrap_or_else(|| home.join("machines.yaml"))
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Option<Duration> {
        self.hard_timeout_secs.map(Duration::from_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn flow_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_ttl_secs)
    }

    pub fn ttls(&self) -> RegistryTtls {
        RegistryTtls {
            browsing: Duration::from_secs(self.browse_ttl_secs),
            spawning: Duration::from_secs(self.spawning_ttl_secs),
            recently_closed: Duration::from_secs(self.recently_closed_ttl_secs),
            suppress: Duration::from_secs(self.suppress_ttl_secs),
        }
    }

    /// Resolve an engine name (or the default) to its name and template
    pub fn engine(&self, name: Option<&str>) -> Result<(String, String), BridgeError> {
        let name = name.unwrap_or(&self.default_engine);
        self.engines
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| BridgeError::UnknownEngine(name.to_string()))
    }

    pub fn engine_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Expiry windows for the session registry's auxiliary sets
#[derive(Debug, Clone, Copy)]
pub struct RegistryTtls {
    pub browsing: Duration,
    pub spawning: Duration,
    pub recently_closed: Duration,
    pub suppress: Duration,
}

impl Default for RegistryTtls {
    fn default() -> Self {
        BridgeConfig::default().ttls()
    }
}
