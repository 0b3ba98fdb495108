use serde::{Deserialize, Serialize};

use msgcore_common::{ConversationId, MessageId, UserId};

/// Upstream client frame, spec §6. Permissively deserialized: unrecognized
/// fields are ignored (serde's default behavior) and `timestamp` is
/// optional — clients that omit it get `received_at` stamped by the
/// Gateway instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub client_msg_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// The other participant of a `single_` conversation, required only on
    /// the first message a pair of users exchange. `conversation_id` for
    /// that kind is a one-way hash of both user ids (spec §3), so there is
    /// no way to recover the peer from it alone; whatever created the
    /// conversation (out of scope here) is expected to pass it once so Logic
    /// can register the pair via `ensure_conversation_participants`.
    /// Ignored for `group_`/`world` conversations.
    #[serde(default)]
    pub peer_user_id: Option<u64>,
}

/// `{ "code": ..., "message": ... }`, embedded in error responses and
/// `error` downstream frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Downstream client frame, spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        client_msg_id: String,
        received_at: i64,
    },
    Message {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        seq_id: u64,
        #[serde(rename = "type")]
        message_type: String,
        content: String,
        created_at: i64,
    },
    Error {
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
        detail: String,
    },
    Ping,
    Pong,
}

impl ServerFrame {
    pub fn error(code: &str, client_msg_id: Option<String>, detail: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            client_msg_id,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_ignores_unknown_fields() {
        let raw = r#"{"conversation_id":"single_abc","content":"hi","type":"text","client_msg_id":"cm-1","bogus":42}"#;
        let frame: ClientFrame = serde_json::from_str(raw).expect("parses");
        assert_eq!(frame.conversation_id, "single_abc");
        assert_eq!(frame.client_msg_id, "cm-1");
    }

    #[test]
    fn server_frame_ack_round_trips() {
        let frame = ServerFrame::Ack {
            client_msg_id: "cm-1".into(),
            received_at: 123,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"ack\""));
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        match back {
            ServerFrame::Ack { client_msg_id, .. } => assert_eq!(client_msg_id, "cm-1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
