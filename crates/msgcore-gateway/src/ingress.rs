//! `read_pump`'s frame-handling logic, spec §4.1: validate an incoming
//! client frame, build the upstream envelope, and publish it with the
//! bounded retry §4.1 "Failure semantics" specifies. Kept separate from
//! [`crate::session`] so the socket-I/O loop and the frame-processing rules
//! can be tested independently.

use std::time::Duration;

use bytes::Bytes;
use msgcore_bus::Topic;
use msgcore_common::{UserId, retry::Backoff, retry_with_backoff};
use msgcore_config::GatewayConfig;
use msgcore_protocol::{ClientFrame, ServerFrame, error_codes};
use uuid::Uuid;

use crate::state::GatewayState;

/// Outcome of handling one raw client frame: what (if anything) to write
/// back to the originating connection immediately.
pub enum IngressOutcome {
    /// Frame published upstream; an `ack` should be sent to the client.
    Acked(ServerFrame),
    /// Frame rejected locally (too large, malformed, rate-limited) or the
    /// upstream publish exhausted its retry budget; an `error` frame should
    /// be sent to the client.
    Rejected(ServerFrame),
}

/// Size check, spec §8 boundary test: exactly `max_frame_bytes` is
/// accepted, one byte over is rejected.
pub fn check_frame_size(raw: &[u8], config: &GatewayConfig) -> Result<(), ServerFrame> {
    if raw.len() > config.max_frame_bytes {
        return Err(ServerFrame::error(error_codes::FRAME_TOO_LARGE, None, format!("frame of {} bytes exceeds the {} byte limit", raw.len(), config.max_frame_bytes)));
    }
    Ok(())
}

/// Parse, validate, and publish one client frame, spec §4.1 `read_pump`.
///
/// Required fields are enforced by [`ClientFrame`]'s (de)serialization —
/// a frame missing `conversation_id`/`content`/`type`/`client_msg_id` fails
/// to parse and is rejected as `invalid_frame`.
pub async fn handle_client_frame(state: &GatewayState, sender: UserId, raw: &[u8]) -> IngressOutcome {
    if let Err(rejected) = check_frame_size(raw, &state.config) {
        return IngressOutcome::Rejected(rejected);
    }

    let frame: ClientFrame = match serde_json::from_slice(raw) {
        Ok(frame) => frame,
        Err(err) => {
            return IngressOutcome::Rejected(ServerFrame::error(error_codes::INVALID_FRAME, None, format!("malformed frame: {err}")));
        },
    };

    let client_msg_id = frame.client_msg_id.clone();
    let received_at = frame.timestamp.unwrap_or_else(|| msgcore_common::now_ms() as i64);
    let trace_id = Uuid::new_v4().to_string();
    let envelope = msgcore_protocol::envelopes::UpstreamEnvelope::from_client_frame(frame, sender, trace_id, received_at);

    let payload = match serde_json::to_vec(&envelope) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            return IngressOutcome::Rejected(ServerFrame::error(error_codes::INTERNAL, Some(client_msg_id), format!("failed to encode envelope: {err}")));
        },
    };

    match publish_with_retry(state, &envelope.conversation_id, payload).await {
        Ok(()) => IngressOutcome::Acked(ServerFrame::Ack {
            client_msg_id,
            received_at,
        }),
        Err(()) => IngressOutcome::Rejected(ServerFrame::error(error_codes::SEND_FAILED, Some(client_msg_id), "upstream publish exhausted its retry budget")),
    }
}

/// Retry with the gateway's configured fixed schedule (spec §4.1: "retry
/// with bounded backoff, default 3 attempts, 50/200/800 ms").
async fn publish_with_retry(state: &GatewayState, conversation_id: &str, payload: Bytes) -> Result<(), ()> {
    let backoff = Backoff::fixed(state.config.upstream_publish_backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect::<Vec<_>>());
    retry_with_backoff(&backoff, || state.upstream_topic.publish(conversation_id, payload.clone())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use msgcore_bus::{DownstreamTopics, InProcessTopic, partition_for};
    use msgcore_repo::InMemoryRepo;

    use super::*;
    use crate::auth::{AuthMode, ResolvedAuth};

    fn make_state() -> Arc<GatewayState> {
        let config = GatewayConfig::default();
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
            config,
        )
    }

    #[test]
    fn frame_at_exactly_the_limit_is_accepted() {
        let config = GatewayConfig::default();
        let raw = vec![b'a'; config.max_frame_bytes];
        assert!(check_frame_size(&raw, &config).is_ok());
    }

    #[test]
    fn frame_one_byte_over_is_rejected() {
        let config = GatewayConfig::default();
        let raw = vec![b'a'; config.max_frame_bytes + 1];
        assert!(check_frame_size(&raw, &config).is_err());
    }

    #[tokio::test]
    async fn valid_frame_is_acked_and_published_upstream() {
        let state = make_state();
        let conv = "single_abc";
        let mut consumer = state.upstream_topic.take_partition(partition_for(conv, 4)).unwrap();
        let raw = format!(r#"{{"conversation_id":"{conv}","content":"hi","type":"text","client_msg_id":"cm-1"}}"#);

        match handle_client_frame(&state, UserId(1), raw.as_bytes()).await {
            IngressOutcome::Acked(ServerFrame::Ack { client_msg_id, .. }) => assert_eq!(client_msg_id, "cm-1"),
            _ => panic!("expected an ack"),
        }

        let (_key, payload) = tokio::time::timeout(Duration::from_millis(100), consumer.recv())
            .await
            .expect("envelope published")
            .expect("channel open");
        let envelope: msgcore_protocol::envelopes::UpstreamEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.client_msg_id, "cm-1");
        assert_eq!(envelope.sender_user_id, UserId(1));
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected_without_publishing() {
        let state = make_state();
        match handle_client_frame(&state, UserId(1), b"{not json").await {
            IngressOutcome::Rejected(ServerFrame::Error { code, .. }) => assert_eq!(code, error_codes::INVALID_FRAME),
            _ => panic!("expected a rejection"),
        }
    }
}
