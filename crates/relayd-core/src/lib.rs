//! relayd-core - chat thread to remote coding CLI session bridge
//!
//! A thread first browses a remote machine's directories, then starts an
//! interactive session there. From then on chat messages are written to the
//! remote process and its terminal output comes back as clean, size-bounded
//! chat messages until the session closes or times out.
//!
//! The pieces, leaf first:
//! - [`terminal`]: output sanitizer, chrome table and message segmenter
//! - [`browse`]: directory browsing navigator
//! - [`registry`]: per-thread ownership state
//! - [`relay`]: inbound message routing
//! - [`lifecycle`]: spawn, stream loop and close
//! - [`ssh`]: remote execution seam and its OpenSSH implementation

pub mod browse;
pub mod chat;
pub mod config;
pub mod error;
pub mod flows;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod ssh;
pub mod terminal;
pub mod transcript;
pub mod types;

#[cfg(test)]
mod testing;

pub use browse::{BrowsingSession, NavAction};
pub use chat::{Button, ChatSink, OutgoingMessage};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use flows::{FlowKind, FlowReply, FlowStore};
pub use lifecycle::{BrowseRequest, CloseReason, LifecycleController};
pub use registry::SessionRegistry;
pub use relay::{InboundMessage, InputRelay, RelayOutcome};
pub use ssh::{OpenSshTransport, RemoteTransport};
pub use types::{ChatKey, Machine, MachineRegistry, OutputMode, ThreadState};
