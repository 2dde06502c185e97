//! Session transcripts and the offline analysis hand-off
//!
//! Every session accumulates an append-only [`Transcript`]. On close it is
//! handed to a [`TranscriptAnalyzer`] on a detached task; closing never waits
//! for the analyzer and never fails because of it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One transcript record, never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Text {
        content: String,
        timestamp: i64,
    },
    ToolUse {
        /// Tool name
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        timestamp: i64,
    },
    Result {
        content: String,
        #[serde(default)]
        is_error: bool,
        timestamp: i64,
    },
    UserInput {
        content: String,
        timestamp: i64,
    },
}

impl TranscriptEntry {
    pub fn text(content: impl Into<String>) -> Self {
        TranscriptEntry::Text {
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn tool_use(name: impl Into<String>, file_path: Option<String>) -> Self {
        TranscriptEntry::ToolUse {
            content: name.into(),
            file_path,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn result(content: impl Into<String>, is_error: bool) -> Self {
        TranscriptEntry::Result {
            content: content.into(),
            is_error,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn user_input(content: impl Into<String>) -> Self {
        TranscriptEntry::UserInput {
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptEntry::Text { .. } => "text",
            TranscriptEntry::ToolUse { .. } => "tool_use",
            TranscriptEntry::Result { .. } => "result",
            TranscriptEntry::UserInput { .. } => "user_input",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TranscriptEntry::Text { content, .. }
            | TranscriptEntry::ToolUse { content, .. }
            | TranscriptEntry::Result { content, .. }
            | TranscriptEntry::UserInput { content, .. } => content,
        }
    }
}

/// Append-only list of entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the analyzer needs to know about the session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptContext {
    pub session_id: String,
    pub thread_id: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub machine: String,
    pub path: String,
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_engine: Option<String>,
    /// Close reason, e.g. `user_requested`, `idle_timeout`
    pub outcome: String,
    pub duration_ms: u64,
    pub turns: u32,
    pub rate_limit_hits: u32,
}

#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync {
    async fn analyze(&self, transcript: Transcript, context: TranscriptContext) -> Result<()>;
}

/// Hand a transcript to the analyzer without waiting for it
pub fn submit_detached(
    analyzer: Arc<dyn TranscriptAnalyzer>,
    transcript: Transcript,
    context: TranscriptContext,
) {
    tokio::spawn(async move {
        let session_id = context.session_id.clone();
        let entries = transcript.len();
        match analyzer.analyze(transcript, context).await {
            Ok(()) => debug!(session = %session_id, entries, "Transcript submitted"),
            Err(e) => warn!(session = %session_id, error = %e, "Transcript analysis failed"),
        }
    });
}

/// Used when no analyzer is configured
#[derive(Debug, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl TranscriptAnalyzer for NoopAnalyzer {
    async fn analyze(&self, _transcript: Transcript, _context: TranscriptContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct TranscriptRecord<'a> {
    context: &'a TranscriptContext,
    entries: &'a [TranscriptEntry],
    archived_at: i64,
}

/// Appends each transcript as one JSON line
#[derive(Debug, Clone)]
pub struct JsonlTranscriptArchive {
    path: PathBuf,
}

impl JsonlTranscriptArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TranscriptAnalyzer for JsonlTranscriptArchive {
    async fn analyze(&self, transcript: Transcript, context: TranscriptContext) -> Result<()> {
        let record = TranscriptRecord {
            context: &context,
            entries: transcript.entries(),
            archived_at: Utc::now().timestamp_millis(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        info!(session = %context.session_id, path = %self.path.display(), "Transcript archived");
        Ok(())
    }
}

/// Posts transcripts to an analysis service
#[derive(Debug, Clone)]
pub struct HttpTranscriptAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpTranscriptAnalyzer {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TranscriptAnalyzer for HttpTranscriptAnalyzer {
    async fn analyze(&self, transcript: Transcript, context: TranscriptContext) -> Result<()> {
        let record = TranscriptRecord {
            context: &context,
            entries: transcript.entries(),
            archived_at: Utc::now().timestamp_millis(),
        };
        let resp = self.client.post(&self.url).json(&record).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("analysis service returned HTTP {}", status.as_u16()));
        }
        Ok(())
    }
}
