//! JSON-lines chat protocol on stdio
//!
//! One JSON object per line in each direction, discriminated by `type`.

use relayd_core::{BrowseRequest, ChatKey, FlowKind, InboundMessage, OutgoingMessage};
use serde::{Deserialize, Serialize};

/// Requests from the chat front end
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Inbound {
    /// A user message in a thread; answered with `relay`
    Message {
        #[serde(default)]
        id: Option<String>,
        chat_id: String,
        thread_id: String,
        #[serde(default)]
        user_id: Option<String>,
        text: String,
    },
    Browse(BrowseRequest),
    Close {
        chat_id: String,
        thread_id: String,
    },
    /// May the conversational layer reply in this thread? Answered with
    /// `should_reply`
    ShouldReply {
        #[serde(default)]
        id: Option<String>,
        chat_id: String,
        thread_id: String,
    },
    FlowStart {
        chat_id: String,
        thread_id: String,
        user_id: String,
        #[serde(default)]
        kind: FlowKind,
    },
    Button {
        chat_id: String,
        thread_id: String,
        user_id: String,
        data: String,
    },
}

impl Inbound {
    /// Thread this request belongs to
    pub fn key(&self) -> ChatKey {
        match self {
            Inbound::Message { chat_id, thread_id, .. }
            | Inbound::Close { chat_id, thread_id }
            | Inbound::ShouldReply { chat_id, thread_id, .. }
            | Inbound::FlowStart { chat_id, thread_id, .. }
            | Inbound::Button { chat_id, thread_id, .. } => ChatKey::new(chat_id, thread_id),
            Inbound::Browse(request) => request.key(),
        }
    }
}

/// Build the relay input for a `message` request
pub fn inbound_message(chat_id: &str, thread_id: &str, user_id: Option<&str>, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: chat_id.to_string(),
        thread_id: thread_id.to_string(),
        user_id: user_id.map(str::to_string),
        text: text.to_string(),
    }
}

/// Lines written to stdout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    Send(OutgoingMessage),
    Relay {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        chat_id: String,
        thread_id: String,
        claimed: bool,
    },
    ShouldReply {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        chat_id: String,
        thread_id: String,
        reply: bool,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_core::types::DispatchMode;

    #[test]
    fn test_parse_message() {
        let line = r#"{"type":"message","id":"m1","chatId":"c1","threadId":"t1","userId":"u1","text":"2"}"#;
        let inbound: Inbound = serde_json::from_str(line).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                id: Some("m1".to_string()),
                chat_id: "c1".to_string(),
                thread_id: "t1".to_string(),
                user_id: Some("u1".to_string()),
                text: "2".to_string(),
            }
        );
        assert_eq!(inbound.key(), ChatKey::new("c1", "t1"));
    }

    #[test]
    fn test_parse_browse() {
        let line = r#"{"type":"browse","chatId":"c1","threadId":"t9","machine":"buildbox","path":"~/proj","prompt":"fix ci","dispatch":"queued"}"#;
        match serde_json::from_str::<Inbound>(line).unwrap() {
            Inbound::Browse(req) => {
                assert_eq!(req.thread_id, "t9");
                assert_eq!(req.path.as_deref(), Some("~/proj"));
                assert_eq!(req.dispatch, DispatchMode::Queued);
                assert_eq!(req.engine, None);
            }
            other => panic!("expected browse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_flow_start_defaults_kind() {
        let line = r#"{"type":"flow_start","chatId":"c1","threadId":"t1","userId":"u1"}"#;
        match serde_json::from_str::<Inbound>(line).unwrap() {
            Inbound::FlowStart { kind, .. } => assert_eq!(kind, FlowKind::NewSession),
            other => panic!("expected flow_start, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_serialize_outbound() {
        let key = ChatKey::new("c1", "t1");
        let send = Outbound::Send(OutgoingMessage::text(&key, "hello"));
        let value = serde_json::to_value(&send).unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["threadId"], "t1");
        assert_eq!(value["text"], "hello");
        assert!(value.get("buttons").is_none());

        let verdict = Outbound::Relay {
            id: Some("m1".to_string()),
            chat_id: "c1".to_string(),
            thread_id: "t1".to_string(),
            claimed: true,
        };
        let value = serde_json::to_value(&verdict).unwrap();
        assert_eq!(value["type"], "relay");
        assert_eq!(value["chatId"], "c1");
        assert_eq!(value["claimed"], true);
    }
}
