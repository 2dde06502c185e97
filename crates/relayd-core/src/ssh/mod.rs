//! Remote execution over SSH
//!
//! [`RemoteTransport`] is the seam between the bridge and the network: one-shot
//! commands for directory listings, and interactive processes whose
//! [`RemoteHandle`] is owned by exactly one session.

mod openssh;
pub mod quote;

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BridgeError;
use crate::types::Machine;

pub use openssh::OpenSshTransport;

/// Result of a one-shot remote command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// What to run interactively
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Remote command line, already quoted for the target shell
    pub command: String,
    /// Allocate a remote PTY (`ssh -tt`)
    pub pty: bool,
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command to completion, bounded by `timeout`
    async fn exec(&self, machine: &Machine, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Start an interactive process. Returns once the connection process is
    /// running; readiness of the remote program is checked by the caller.
    async fn spawn_interactive(&self, machine: &Machine, spec: SpawnSpec) -> Result<RemoteHandle>;
}

/// Lifetime control of the process behind a handle
pub trait ProcessControl: Send {
    /// Kill the process and release its resources. Must be idempotent.
    fn terminate(&mut self);
}

/// Exclusive handle to a live remote process.
///
/// Dropping the handle terminates the process.
pub struct RemoteHandle {
    input: mpsc::UnboundedSender<Vec<u8>>,
    output: Option<mpsc::Receiver<Vec<u8>>>,
    control: Box<dyn ProcessControl>,
    closed: bool,
}

impl RemoteHandle {
    pub fn new(
        input: mpsc::UnboundedSender<Vec<u8>>,
        output: mpsc::Receiver<Vec<u8>>,
        control: Box<dyn ProcessControl>,
    ) -> Self {
        Self {
            input,
            output: Some(output),
            control,
            closed: false,
        }
    }

    /// Queue bytes for the remote process's stdin
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        self.input
            .send(bytes.into())
            .map_err(|_| BridgeError::Closed)
    }

    /// Take the output stream; `None` once taken
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output.take()
    }

    /// Read output until `marker` appears. Returns whatever followed the
    /// marker in the same read so no output is lost.
    pub async fn wait_for_marker(&mut self, marker: &str) -> Result<Vec<u8>> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| anyhow!("output stream already taken"))?;
        let needle = marker.as_bytes();
        let mut seen: Vec<u8> = Vec::new();

        while let Some(chunk) = output.recv().await {
            seen.extend_from_slice(&chunk);
            if let Some(pos) = find_subslice(&seen, needle) {
                let mut rest = seen.split_off(pos + needle.len());
                // Drop the newline that ends the marker line
                let skip = rest
                    .iter()
                    .take_while(|b| **b == b'\r' || **b == b'\n')
                    .count();
                rest.drain(..skip);
                debug!(leftover = rest.len(), "Remote ready marker seen");
                return Ok(rest);
            }
        }

        let text = String::from_utf8_lossy(&seen);
        let tail = text.trim();
        if tail.is_empty() {
            Err(BridgeError::Transport("connection closed before the remote shell was ready".to_string()).into())
        } else {
            Err(BridgeError::Transport(last_lines(tail, 5)).into())
        }
    }

    /// Terminate the process. Further writes fail with [`BridgeError::Closed`].
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.control.terminate();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("closed", &self.closed)
            .field("output_taken", &self.output.is_none())
            .finish()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingControl(Arc<AtomicUsize>);

    impl ProcessControl for CountingControl {
        fn terminate(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle() -> (RemoteHandle, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>, Arc<AtomicUsize>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(16);
        let kills = Arc::new(AtomicUsize::new(0));
        let h = RemoteHandle::new(in_tx, out_rx, Box::new(CountingControl(Arc::clone(&kills))));
        (h, out_tx, in_rx, kills)
    }

    #[tokio::test]
    async fn test_marker_split_across_chunks() {
        let (mut h, out_tx, _in_rx, _) = handle();
        out_tx.send(b"Last login: today\r\n__REL".to_vec()).await.unwrap();
        out_tx.send(b"AYD_READY__\r\nWelcome".to_vec()).await.unwrap();
        let rest = h.wait_for_marker("__RELAYD_READY__").await.unwrap();
        assert_eq!(rest, b"Welcome");
    }

    #[tokio::test]
    async fn test_marker_missing_reports_output() {
        let (mut h, out_tx, _in_rx, _) = handle();
        out_tx.send(b"ssh: connect to host x port 22: Connection refused\r\n".to_vec()).await.unwrap();
        drop(out_tx);
        let err = h.wait_for_marker("__RELAYD_READY__").await.unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (mut h, _out_tx, mut in_rx, kills) = handle();
        h.write(b"hi".to_vec()).unwrap();
        assert_eq!(in_rx.recv().await.unwrap(), b"hi");
        h.close();
        h.close();
        assert!(matches!(h.write(b"x".to_vec()), Err(BridgeError::Closed)));
        drop(h);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }
}
