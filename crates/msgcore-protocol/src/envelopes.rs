use serde::{Deserialize, Serialize};

use msgcore_common::{ConversationId, MessageId, UserId};

use crate::frames::ClientFrame;

/// Published to `upstream`, keyed by `conversation_id` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEnvelope {
    pub sender_user_id: UserId,
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub client_msg_id: String,
    pub trace_id: String,
    pub received_at: i64,
    pub peer_user_id: Option<UserId>,
}

impl UpstreamEnvelope {
    pub fn from_client_frame(frame: ClientFrame, sender: UserId, trace_id: String, received_at: i64) -> Self {
        Self {
            sender_user_id: sender,
            conversation_id: frame.conversation_id,
            content: frame.content,
            message_type: frame.message_type,
            client_msg_id: frame.client_msg_id,
            trace_id,
            received_at,
            peer_user_id: frame.peer_user_id.map(UserId),
        }
    }
}

/// A fully persisted message, as returned by Repo reads and embedded in
/// downstream/task envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub seq_id: u64,
    pub client_msg_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub content: String,
    pub created_at: i64,
}

/// Published to `downstream-{gateway_instance_id}`, keyed by `target_user_id`
/// (spec §6). Most envelopes carry a delivered message; `CloseSession` is the
/// duplicate-login control event (spec §4.1 "Session acquisition") one
/// gateway instance sends to another to ask it to drop a stale connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownstreamPayload {
    Message(MessageRecord),
    CloseSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamEnvelope {
    pub target_user_id: UserId,
    pub trace_id: String,
    pub payload: DownstreamPayload,
}

/// Published to `task`, keyed by `conversation_id` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub message_record: MessageRecord,
    pub conversation_id: ConversationId,
    pub seq_id: u64,
    pub sender_id: UserId,
    pub trace_id: String,
}
