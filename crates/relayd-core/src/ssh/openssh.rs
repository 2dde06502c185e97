//! OpenSSH client transport
//!
//! Shells out to the system `ssh` binary with `BatchMode=yes`, so keys and
//! known hosts come from the operator's SSH configuration. Interactive
//! sessions that need a terminal run `ssh -tt` inside a local PTY; piped
//! sessions use plain process pipes.

use std::io::{Read, Write};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ExecOutput, ProcessControl, RemoteHandle, RemoteTransport, SpawnSpec};
use crate::error::BridgeError;
use crate::types::Machine;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_binary: String,
    connect_timeout_secs: u64,
    rows: u16,
    cols: u16,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            connect_timeout_secs: 15,
            rows: 50,
            cols: 200,
        }
    }
}

impl OpenSshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, ssh_binary: impl Into<String>) -> Self {
        self.ssh_binary = ssh_binary.into();
        self
    }

    /// Terminal size requested for PTY sessions
    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn spawn_piped(&self, machine: &Machine, spec: &SpawnSpec) -> Result<RemoteHandle> {
        let mut child = Command::new(&self.ssh_binary)
            .args(machine.ssh_args(self.connect_timeout_secs))
            .arg(&spec.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.ssh_binary))?;

        let mut stdin = child.stdin.take().context("ssh stdin unavailable")?;
        let mut stdout = child.stdout.take().context("ssh stdout unavailable")?;
        let mut stderr = child.stderr.take().context("ssh stderr unavailable")?;

        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(bytes) = in_rx.recv().await {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "ssh stdin closed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let err_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "ssh stdout read error");
                        break;
                    }
                }
            }
        });

        // stderr joins the output stream so connection failures are visible
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            while let Ok(n) = stderr.read(&mut buf).await {
                if n == 0 || err_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });

        Ok(RemoteHandle::new(
            in_tx,
            out_rx,
            Box::new(PipedControl { child: Some(child) }),
        ))
    }

    fn spawn_pty(&self, machine: &Machine, spec: &SpawnSpec) -> Result<RemoteHandle> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&self.ssh_binary);
        cmd.arg("-tt");
        cmd.args(machine.ssh_args(self.connect_timeout_secs));
        cmd.arg(&spec.command);
        // portable-pty starts with an empty environment
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);
        info!(pid = ?child.process_id(), machine = %machine.name, "ssh PTY spawned");

        let mut writer = pair.master.take_writer()?;
        let mut reader = pair.master.try_clone_reader()?;

        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how a PTY reports the far side hanging up
                        debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = in_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                    error!(error = %e, "PTY write error");
                    break;
                }
            }
        });

        Ok(RemoteHandle::new(
            in_tx,
            out_rx,
            Box::new(PtyControl {
                child: Some(child),
                _master: pair.master,
            }),
        ))
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn exec(&self, machine: &Machine, command: &str, timeout: Duration) -> Result<ExecOutput> {
        debug!(machine = %machine.name, command = %command, "ssh exec");
        let output = Command::new(&self.ssh_binary)
            .args(machine.ssh_args(self.connect_timeout_secs))
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| BridgeError::Transport(format!("ssh to {} timed out after {:?}", machine.name, timeout)))?
            .with_context(|| format!("failed to run {}", self.ssh_binary))?;

        Ok(ExecOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn_interactive(&self, machine: &Machine, spec: SpawnSpec) -> Result<RemoteHandle> {
        info!(machine = %machine.name, pty = spec.pty, "Spawning remote session");
        if spec.pty {
            self.spawn_pty(machine, &spec)
        } else {
            self.spawn_piped(machine, &spec)
        }
    }
}

struct PipedControl {
    child: Option<tokio::process::Child>,
}

impl ProcessControl for PipedControl {
    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "ssh already exited");
            }
        }
    }
}

struct PtyControl {
    child: Option<Box<dyn Child + Send + Sync>>,
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessControl for PtyControl {
    fn terminate(&mut self) {
        if let Some(child) = self.child.take() {
            kill_and_reap(child);
        }
    }
}

/// Kill a PTY child and wait on it so no zombie `ssh` is left behind.
/// The wait runs on the blocking pool when a runtime is available.
fn kill_and_reap(mut child: Box<dyn Child + Send + Sync>) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(code = status.exit_code(), "ssh PTY child already exited");
        return;
    }
    if let Err(e) = child.kill() {
        debug!(error = %e, "ssh PTY child already gone");
    }
    let mut reap = move || match child.wait() {
        Ok(status) => debug!(code = status.exit_code(), "ssh PTY child reaped"),
        Err(e) => warn!(error = %e, "failed to reap ssh PTY child"),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn_blocking(reap);
        }
        Err(_) => reap(),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn is_running_or_zombie(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn test_terminated_child_is_reaped() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        kill_and_reap(Box::new(child));

        for _ in 0..100 {
            if !is_running_or_zombie(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("pid {pid} was never reaped");
    }

    #[test]
    fn test_reap_without_runtime() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        kill_and_reap(Box::new(child));
        assert!(!is_running_or_zombie(pid));
    }
}
