//! Conversation-list API (spec §6): `GetConversations`, `GetMessages`,
//! `MarkAsRead`, exposed as bus-bridged request/response RPCs over plain
//! JSON HTTP routes rather than the `/ws` frame stream — these are
//! synchronous reads/acks, not part of the send path, so they don't need a
//! session. Handlers are thin: decode params, call `Arc<dyn Repo>`, shape
//! the response. Scope/auth follows the same bearer check as `/ws` (spec §6
//! treats credential/JWT issuance as an external collaborator; this reuses
//! the gateway's own resolved token/password check).

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use msgcore_common::{ConversationId, UserId};
use msgcore_protocol::{ErrorShape, error_codes};
use msgcore_repo::PeerSummary;
use serde::{Deserialize, Serialize};

use crate::{auth, state::GatewayState};

#[derive(Debug, Deserialize)]
pub struct GetConversationsParams {
    pub user_id: u64,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerSummaryWire {
    Single { peer_user_id: u64 },
    Group { group_id: u64, member_count: u64 },
    World,
}

impl From<PeerSummary> for PeerSummaryWire {
    fn from(p: PeerSummary) -> Self {
        match p {
            PeerSummary::Single { peer } => PeerSummaryWire::Single { peer_user_id: peer.0 },
            PeerSummary::Group { group_id, member_count } => PeerSummaryWire::Group { group_id: group_id.0, member_count },
            PeerSummary::World => PeerSummaryWire::World,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationSummaryWire {
    pub conversation_id: String,
    pub last_message: Option<msgcore_protocol::envelopes::MessageRecord>,
    pub unread_count: u64,
    pub peer_summary: PeerSummaryWire,
}

/// `GetConversations(user_id) -> [ConversationSummary]`, ordered by
/// `last_message.created_at` descending (already sorted by `Repo`).
pub async fn get_conversations(State(state): State<Arc<GatewayState>>, axum::extract::Query(params): axum::extract::Query<GetConversationsParams>) -> impl IntoResponse {
    if let Some(resp) = reject_unauthorized(&state, params.token.as_deref(), params.password.as_deref()) {
        return resp;
    }

    match state.repo.get_conversation_list(UserId(params.user_id)).await {
        Ok(summaries) => {
            let wire: Vec<ConversationSummaryWire> = summaries
                .into_iter()
                .map(|s| ConversationSummaryWire {
                    conversation_id: s.conversation_id.as_str().to_string(),
                    last_message: s.last_message,
                    unread_count: s.unread_count,
                    peer_summary: s.peer_summary.into(),
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "conversations": wire }))).into_response()
        },
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesParams {
    pub user_id: u64,
    pub conversation_id: String,
    #[serde(default)]
    pub from_seq: u64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub token: Option<String>,
    pub password: Option<String>,
}

fn default_limit() -> usize {
    msgcore_protocol::MAX_GET_MESSAGES_LIMIT
}

/// `GetMessages(user_id, conversation_id, from_seq, limit) -> [Message]`.
/// `user_id` is accepted but not currently used to scope access — membership
/// checks are Logic's job on the send path (spec §6 Non-goals exclude authz
/// beyond the bearer check already performed here).
pub async fn get_messages(State(state): State<Arc<GatewayState>>, axum::extract::Query(params): axum::extract::Query<GetMessagesParams>) -> impl IntoResponse {
    if let Some(resp) = reject_unauthorized(&state, params.token.as_deref(), params.password.as_deref()) {
        return resp;
    }

    let conversation_id = ConversationId(params.conversation_id);
    match state.repo.get_messages(&conversation_id, params.from_seq, params.limit).await {
        Ok(messages) => (StatusCode::OK, Json(serde_json::json!({ "messages": messages }))).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct MarkAsReadParams {
    pub user_id: u64,
    pub conversation_id: String,
    pub up_to_seq: u64,
    pub token: Option<String>,
    pub password: Option<String>,
}

/// `MarkAsRead(user_id, conversation_id, up_to_seq) -> ack`. Idempotent
/// (spec §4.4), so this is a plain success/failure response, no body.
pub async fn mark_as_read(State(state): State<Arc<GatewayState>>, Json(params): Json<MarkAsReadParams>) -> impl IntoResponse {
    if let Some(resp) = reject_unauthorized(&state, params.token.as_deref(), params.password.as_deref()) {
        return resp;
    }

    let conversation_id = ConversationId(params.conversation_id);
    match state.repo.mark_as_read(&conversation_id, UserId(params.user_id), params.up_to_seq).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ack": true }))).into_response(),
        Err(err) => internal_error(err),
    }
}

fn reject_unauthorized(state: &GatewayState, token: Option<&str>, password: Option<&str>) -> Option<axum::response::Response> {
    let result = auth::authorize_connect(&state.auth, token, password, None);
    if result.ok {
        None
    } else {
        let reason = result.reason.unwrap_or_else(|| "unauthorized".to_string());
        Some((StatusCode::UNAUTHORIZED, Json(ErrorShape::new(error_codes::UNAUTHORIZED, reason))).into_response())
    }
}

fn internal_error(err: msgcore_repo::RepoError) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorShape::new(error_codes::INTERNAL, err.to_string()))).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use msgcore_bus::{DownstreamTopics, InProcessTopic};
    use msgcore_config::GatewayConfig;
    use msgcore_protocol::envelopes::MessageRecord;
    use msgcore_repo::InMemoryRepo;

    use super::*;
    use crate::auth::{AuthMode, ResolvedAuth};

    fn make_state() -> Arc<GatewayState> {
        GatewayState::new(
            "gw-test",
            Arc::new(InMemoryRepo::new()),
            InProcessTopic::new("upstream-test", 4, 64),
            Arc::new(DownstreamTopics::new(4)),
            ResolvedAuth {
                mode: AuthMode::Token,
                token: Some("secret".into()),
                password: None,
            },
            GatewayConfig::default(),
        )
    }

    #[tokio::test]
    async fn get_messages_round_trips_a_saved_message() {
        let state = make_state();
        let conv = ConversationId("single_abc".to_string());
        let msg = MessageRecord {
            message_id: msgcore_common::MessageId(1),
            conversation_id: conv.clone(),
            sender_id: UserId(1),
            seq_id: 1,
            client_msg_id: "cm-1".into(),
            message_type: "text".into(),
            content: "hi".into(),
            created_at: 1000,
        };
        state.repo.save_message(msg.clone(), &[UserId(2)]).await.unwrap();

        let params = GetMessagesParams {
            user_id: 2,
            conversation_id: "single_abc".into(),
            from_seq: 1,
            limit: 10,
            token: Some("secret".into()),
            password: None,
        };
        let resp = get_messages(State(Arc::clone(&state)), axum::extract::Query(params)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unauthorized_request_is_rejected() {
        let state = make_state();
        let params = GetMessagesParams {
            user_id: 2,
            conversation_id: "single_abc".into(),
            from_seq: 0,
            limit: 10,
            token: Some("wrong".into()),
            password: None,
        };
        let resp = get_messages(State(state), axum::extract::Query(params)).await.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
