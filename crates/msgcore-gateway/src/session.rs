//! Per-connection `read_pump` / `write_pump` tasks, spec §4.1.
//!
//! One WebSocket carries framed JSON in both directions — client frames
//! upstream, [`ServerFrame`]s (including the `ping`/`pong` heartbeat, spec
//! §6) downstream — so both pumps speak the same `ClientFrame`/`ServerFrame`
//! vocabulary `msgcore-protocol` defines rather than native WS control
//! frames.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use msgcore_common::UserId;
use msgcore_protocol::{ServerFrame, envelopes::DownstreamEnvelope};
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::{
    ingress::{IngressOutcome, handle_client_frame},
    ratelimit::RateLimiter,
    state::{ConnectedClient, GatewayState},
};

/// Only the field every downstream client frame needs to be told apart from
/// a regular message frame — a client replying to a heartbeat `ping` sends
/// back `{"kind":"pong"}` with no other required fields, which would
/// otherwise fail [`msgcore_protocol::ClientFrame`]'s stricter deserialization.
#[derive(Debug, Deserialize)]
struct FrameProbe {
    #[serde(default)]
    kind: Option<String>,
}

/// Session acquisition (spec §4.1 "Session acquisition") plus the
/// read/write pump pair. Runs until the socket closes, the session is
/// force-closed (duplicate login), or a fatal I/O error occurs.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, user_id: UserId) {
    // If another instance already owns this user's session, ask it to drop
    // the stale connection before we accept (spec §4.1). Best-effort: if
    // that instance is unreachable the old session self-terminates on its
    // next write failure or lease expiry.
    if let Some(existing) = state.repo.get_session_pointer(user_id).await
        && existing.gateway_instance_id != state.instance_id
    {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let close_envelope = msgcore_sessions::registry::close_session_envelope(user_id, &trace_id);
        let topic = state.downstream_topics.get_or_create(&existing.gateway_instance_id);
        if let Ok(bytes) = serde_json::to_vec(&close_envelope) {
            if let Err(err) = publish_control(&topic, user_id, bytes).await {
                warn!(error = %err, %user_id, prior_instance = %existing.gateway_instance_id, "failed to signal prior instance of duplicate login; proceeding anyway");
            }
        }
    }

    let ttl = Duration::from_secs(msgcore_protocol::SESSION_TTL_SECS);
    state.repo.set_session_pointer(user_id, &state.instance_id, ttl).await;

    let conn_id = state.next_conn_id();
    let (sender, receiver) = mpsc::channel::<ServerFrame>(state.config.write_pump_capacity);
    let close = Arc::new(Notify::new());

    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            user_id,
            sender,
            close: Arc::clone(&close),
            connected_at: std::time::Instant::now(),
            last_activity: std::time::Instant::now(),
        })
        .await;
    info!(%conn_id, %user_id, "session acquired");

    let (ws_sink, ws_stream) = socket.split();
    let limiter = RateLimiter::new(state.config.rate_limit_per_sec, state.config.rate_limit_burst);

    let write_state = Arc::clone(&state);
    let write_user = user_id;
    let write_close = Arc::clone(&close);
    let writer = tokio::spawn(async move { write_pump(write_state, write_user, ws_sink, receiver, write_close).await });

    read_pump(Arc::clone(&state), user_id, ws_stream, &limiter, &close).await;

    // Either pump exiting ends the session: cancel the other and clean up.
    close.notify_waiters();
    let _ = writer.await;

    state.remove_client(&conn_id).await;
    // CAS clear: only remove the pointer if it still names this instance —
    // a duplicate-login takeover may already have overwritten it.
    state.repo.clear_session_pointer(user_id, &state.instance_id).await;
    info!(%conn_id, %user_id, "session released");
}

async fn publish_control(topic: &msgcore_bus::InProcessTopic, user_id: UserId, payload: Vec<u8>) -> Result<(), msgcore_bus::BusError> {
    use msgcore_bus::Topic;
    topic.publish(&user_id.to_string(), bytes::Bytes::from(payload)).await
}

/// Reads one framed JSON message at a time, spec §4.1 `read_pump`. Read
/// deadline is `read_deadline_multiple * ping_interval` — if nothing
/// arrives (not even a `pong`) within that window, the connection is
/// considered dead.
async fn read_pump(
    state: Arc<GatewayState>,
    user_id: UserId,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    limiter: &RateLimiter,
    close: &Notify,
) {
    let read_deadline = Duration::from_millis(state.config.ping_interval_ms * state.config.read_deadline_multiple);

    loop {
        let next = tokio::select! {
            biased;
            _ = close.notified() => return,
            result = tokio::time::timeout(read_deadline, ws_stream.next()) => result,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                debug!(error = %err, %user_id, "websocket read error, closing session");
                return;
            },
            Ok(None) => return,
            Err(_) => {
                debug!(%user_id, "read deadline exceeded, closing session");
                return;
            },
        };

        match message {
            Message::Text(text) => {
                if !limiter.try_acquire() {
                    let frame = ServerFrame::error(msgcore_protocol::error_codes::RATE_LIMITED, None, "per-session rate limit exceeded");
                    state.deliver_local(user_id, frame).await;
                    continue;
                }
                handle_text_frame(&state, user_id, text.as_bytes()).await;
            },
            Message::Binary(bytes) => {
                if !limiter.try_acquire() {
                    let frame = ServerFrame::error(msgcore_protocol::error_codes::RATE_LIMITED, None, "per-session rate limit exceeded");
                    state.deliver_local(user_id, frame).await;
                    continue;
                }
                handle_text_frame(&state, user_id, &bytes).await;
            },
            Message::Close(_) => return,
            // Native WS-level ping/pong are answered by the underlying
            // transport; the application heartbeat is the `ping`/`pong`
            // JSON frame handled in `handle_text_frame`.
            Message::Ping(_) | Message::Pong(_) => {},
        }
    }
}

async fn handle_text_frame(state: &GatewayState, user_id: UserId, raw: &[u8]) {
    if let Ok(probe) = serde_json::from_slice::<FrameProbe>(raw)
        && probe.kind.as_deref() == Some("pong")
    {
        return;
    }

    match handle_client_frame(state, user_id, raw).await {
        IngressOutcome::Acked(frame) | IngressOutcome::Rejected(frame) => {
            state.deliver_local(user_id, frame).await;
        },
    }
}

/// Drains the bounded per-connection channel to the socket, spec §4.1
/// `write_pump`. Each write has its own deadline; on a write error or
/// timeout the socket is closed and the session is released. Also sends
/// the periodic heartbeat `ping` and refreshes this user's `SessionPointer`
/// lease on the same tick.
async fn write_pump(
    state: Arc<GatewayState>,
    user_id: UserId,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<ServerFrame>,
    close: Arc<Notify>,
) {
    let write_deadline = Duration::from_millis(state.config.write_deadline_ms);
    let mut ping_tick = tokio::time::interval(Duration::from_millis(state.config.ping_interval_ms));
    let ttl = Duration::from_secs(msgcore_protocol::SESSION_TTL_SECS);

    loop {
        tokio::select! {
            biased;
            _ = close.notified() => {
                let _ = ws_sink.send(Message::Close(None)).await;
                return;
            }
            _ = ping_tick.tick() => {
                state.repo.refresh_session_pointer(user_id, ttl).await;
                if write_frame(&mut ws_sink, &ServerFrame::Ping, write_deadline).await.is_err() {
                    return;
                }
            }
            frame = receiver.recv() => {
                let Some(frame) = frame else { return };
                if write_frame(&mut ws_sink, &frame, write_deadline).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_frame(ws_sink: &mut futures::stream::SplitSink<WebSocket, Message>, frame: &ServerFrame, deadline: Duration) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Err(());
    };
    match tokio::time::timeout(deadline, ws_sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "write_pump send failed");
            Err(())
        },
        Err(_) => {
            debug!("write_pump deadline exceeded");
            Err(())
        },
    }
}

/// Dispatch one delivered [`DownstreamEnvelope`] to its target's local
/// connection, spec §4.1 "Downstream consumer". Used by
/// [`crate::downstream`]'s per-partition consumer task.
pub async fn deliver_downstream(state: &GatewayState, envelope: DownstreamEnvelope) {
    use msgcore_protocol::envelopes::DownstreamPayload;

    match envelope.payload {
        DownstreamPayload::Message(record) => {
            let frame = ServerFrame::Message {
                message_id: record.message_id,
                conversation_id: record.conversation_id,
                sender_id: record.sender_id,
                seq_id: record.seq_id,
                message_type: record.message_type,
                content: record.content,
                created_at: record.created_at,
            };
            // Non-blocking enqueue; a full channel or absent session is not
            // an error (spec §4.1: drop-and-log, the client reconciles via
            // sequence-gap pull).
            if !state.deliver_local(envelope.target_user_id, frame).await {
                debug!(target_user_id = %envelope.target_user_id, "downstream message dropped: no local session or channel full");
            }
        },
        DownstreamPayload::CloseSession => {
            if state.close_local(envelope.target_user_id).await.is_some() {
                info!(target_user_id = %envelope.target_user_id, "closed stale local session on duplicate-login signal");
            }
        },
    }
}
