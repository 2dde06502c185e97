//! Line decoder for stream-json output
//!
//! Bytes arrive in arbitrary chunks from the remote process. The decoder
//! buffers until a newline, then parses each complete line into a
//! [`StreamEvent`]. Lines that are not JSON (shell banners, warnings) are
//! surfaced as [`Decoded::Noise`] so the caller can decide what to do.

use crate::types::*;
use serde_json::json;
use tracing::debug;

/// One decoded line
#[derive(Debug, Clone)]
pub enum Decoded {
    Event(StreamEvent),
    /// Valid JSON with an unrecognized `type`
    Unknown(String),
    /// Non-JSON text
    Noise(String),
}

/// Incremental newline-delimited JSON decoder
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(decoded) = decode_bytes(&line) {
                out.push(decoded);
            }
        }
        out
    }

    /// Decode whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<Decoded> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        decode_bytes(&rest)
    }
}

fn decode_bytes(line: &[u8]) -> Option<Decoded> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match decode_line(trimmed) {
        Ok(Some(event)) => Decoded::Event(event),
        Ok(None) => Decoded::Unknown(trimmed.to_string()),
        Err(e) => {
            debug!(line = %trimmed, error = %e, "Non-JSON line from remote CLI");
            Decoded::Noise(trimmed.to_string())
        }
    })
}

/// Parse one line. `Ok(None)` means valid JSON of an unknown type.
pub fn decode_line(line: &str) -> Result<Option<StreamEvent>, StreamError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let Some(event_type) = value.get("type").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let event = match event_type {
        "result" => StreamEvent::Result(serde_json::from_value(value)?),
        "assistant" => StreamEvent::Assistant(serde_json::from_value(value)?),
        "user" => StreamEvent::User(serde_json::from_value(value)?),
        "system" => StreamEvent::System(serde_json::from_value(value)?),
        other => {
            debug!(event_type = %other, "Unknown event type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Encode a user turn for `--input-format stream-json`, newline-terminated
pub fn user_input_line(text: &str) -> String {
    let line = json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": text}],
        },
    });
    format!("{}\n", line)
}
