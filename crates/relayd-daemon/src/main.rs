//! relayd - chat thread to remote coding CLI bridge daemon
//!
//! Responsibilities:
//! - Load the bridge config and machine registry
//! - Speak the JSON-lines chat protocol on stdin/stdout
//! - Route each thread's requests through its own worker
//! - Sweep expired flows and registry entries
//! - Close every session on stdin EOF or Ctrl+C

mod dispatch;
mod protocol;
mod stdio;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use relayd_core::config::{config_path, default_home};
use relayd_core::queue::{HttpTaskQueue, TaskQueue, UnconfiguredQueue};
use relayd_core::transcript::{
    HttpTranscriptAnalyzer, JsonlTranscriptArchive, TranscriptAnalyzer,
};
use relayd_core::{
    BridgeConfig, FlowStore, InputRelay, LifecycleController, MachineRegistry, OpenSshTransport,
    SessionRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{AppState, Dispatcher};
use crate::protocol::{Inbound, Outbound};
use crate::stdio::{run_writer, StdoutChatSink};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "relayd", version, about = "Bridge chat threads to remote coding CLI sessions")]
struct Cli {
    /// Home directory for config, logs and transcripts
    #[arg(long)]
    home: Option<PathBuf>,

    /// Bridge config file (default: <home>/relayd.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Machine registry file (default: <home>/machines.yaml)
    #[arg(long)]
    machines: Option<PathBuf>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("RELAYD_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn analyzer(config: &BridgeConfig, home: &std::path::Path) -> Result<Arc<dyn TranscriptAnalyzer>> {
    Ok(match config.analysis_url.as_deref() {
        Some(url) => {
            info!(url = %url, "Transcripts go to the analysis service");
            Arc::new(HttpTranscriptAnalyzer::new(url)?)
        }
        None => {
            let path = home.join("transcripts.jsonl");
            info!(path = %path.display(), "Transcripts are archived locally");
            Arc::new(JsonlTranscriptArchive::new(path))
        }
    })
}

fn task_queue(config: &BridgeConfig) -> Result<Arc<dyn TaskQueue>> {
    Ok(match config.queue_url.as_deref() {
        Some(url) => Arc::new(HttpTaskQueue::new(url)?),
        None => Arc::new(UnconfiguredQueue),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(default_home);
    std::fs::create_dir_all(&home).ok();

    // Dual-layer logging: stderr + file (daily rotation). Stdout is the protocol.
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "relayd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config_file = cli.config.clone().unwrap_or_else(|| config_path(&home));
    let config = Arc::new(BridgeConfig::load(&config_file)?);
    let machines_file = cli
        .machines
        .clone()
        .unwrap_or_else(|| config.machines_path(&home));
    let machines = Arc::new(MachineRegistry::load(&machines_file)?);
    if machines.machines.is_empty() {
        warn!(path = %machines_file.display(), "No machines configured");
    }
    info!(
        home = %home.display(),
        config = %config_file.display(),
        machines = machines.machines.len(),
        engines = ?config.engine_names(),
        "relayd starting"
    );

    let (out, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(run_writer(out_rx, tokio::io::stdout()));

    let chat = Arc::new(StdoutChatSink::new(out.clone()));
    let registry = Arc::new(SessionRegistry::new(config.ttls()));
    let controller = Arc::new(
        LifecycleController::new(
            Arc::clone(&config),
            Arc::clone(&machines),
            Arc::clone(&registry),
            Arc::new(OpenSshTransport::new()),
            chat.clone(),
        )
        .with_analyzer(analyzer(&config, &home)?)
        .with_queue(task_queue(&config)?),
    );
    let flows = Arc::new(FlowStore::new(
        config.flow_ttl(),
        machines.names(),
        config.engine_names(),
    ));
    let relay = Arc::new(InputRelay::new(Arc::clone(&controller), flows, chat));
    let dispatcher = Dispatcher::new(AppState {
        relay: Arc::clone(&relay),
        controller: Arc::clone(&controller),
        out: out.clone(),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Inbound>(line) {
                            Ok(inbound) => dispatcher.dispatch(inbound),
                            Err(e) => {
                                warn!(error = %e, "Rejected inbound line");
                                let _ = out.send(Outbound::Error {
                                    id: None,
                                    message: format!("invalid request: {}", e),
                                });
                            }
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin, shutting down");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                let flows = relay.flows().sweep();
                let entries = registry.purge_expired();
                let workers = dispatcher.prune();
                if flows + entries + workers > 0 {
                    debug!(flows, entries, workers, "Swept expired state");
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    controller.shutdown_all().await;

    // The writer exits once every sender is gone.
    drop(dispatcher);
    drop(relay);
    drop(controller);
    drop(out);
    match tokio::time::timeout(WRITER_DRAIN, writer).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Chat writer failed"),
        Ok(Err(e)) => warn!(error = %e, "Chat writer task panicked"),
        Err(_) => warn!("Chat writer did not drain in time"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("relayd stopped");
    Ok(())
}
