//! Typed bridge errors
//!
//! Application seams return `anyhow::Result`; these variants exist for the
//! cases a caller branches on.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Unknown machine: {0}")]
    UnknownMachine(String),

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("A session is already running in thread {0}")]
    SessionExists(String),

    #[error("Session start timed out after {0:?}")]
    SpawnTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No active session in thread {0}")]
    NotActive(String),

    #[error("Session closed")]
    Closed,
}
