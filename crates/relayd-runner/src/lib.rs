//! relayd-runner - stream-json protocol of the remote coding CLI
//!
//! Decodes `--output-format stream-json` lines into typed events and
//! encodes user turns for `--input-format stream-json`.
//!
//! # Example
//!
//! ```
//! use relayd_runner::{Decoded, LineDecoder, StreamEvent};
//!
//! let mut decoder = LineDecoder::new();
//! let out = decoder.push(b"{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\"}\n");
//! assert!(matches!(out[0], Decoded::Event(StreamEvent::Result(_))));
//! ```

mod decoder;
mod types;

pub use decoder::{decode_line, user_input_line, Decoded, LineDecoder};
pub use types::*;
