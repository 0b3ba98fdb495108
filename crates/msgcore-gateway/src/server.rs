use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use msgcore_common::UserId;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{auth, downstream, rpc, session::handle_connection, state::GatewayState};

/// Build the gateway router (shared between production startup and tests).
///
/// `/conversations`, `/messages`, `/read` are the spec §6 conversation-list
/// API (`GetConversations`/`GetMessages`/`MarkAsRead`) — bus-bridged RPCs
/// realized here as plain JSON HTTP routes since they're synchronous reads
/// and acks outside the `/ws` send path.
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/conversations", get(rpc::get_conversations))
        .route("/messages", get(rpc::get_messages))
        .route("/read", post(rpc::mark_as_read))
        .layer(cors)
        .with_state(state)
}

/// Spawn this instance's downstream-consumer tasks and start the HTTP +
/// WebSocket server on `state.config`'s `bind`/`port`.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    downstream::spawn_consumers(Arc::clone(&state));

    let app = build_gateway_app(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", state.config.bind, state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(instance_id = %state.instance_id, protocol_version = msgcore_protocol::PROTOCOL_VERSION, %addr, "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let count = state.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "protocol_version": msgcore_protocol::PROTOCOL_VERSION,
        "connections": count,
    }))
}

/// Query parameters carried on the `/ws` upgrade request. Real identity/JWT
/// issuance is out of scope (spec §1 Non-goals); `user_id` is taken as
/// asserted here, gated by the shared token/password `authorize_connect`
/// already enforces.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: u64,
    token: Option<String>,
    password: Option<String>,
}

async fn ws_upgrade_handler(ws: WebSocketUpgrade, ConnectInfo(addr): ConnectInfo<SocketAddr>, Query(params): Query<ConnectParams>, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let remote_ip = addr.ip().to_string();
    let result = auth::authorize_connect(&state.auth, params.token.as_deref(), params.password.as_deref(), Some(&remote_ip));
    if !result.ok {
        let reason = result.reason.unwrap_or_else(|| "unauthorized".to_string());
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": reason }))).into_response();
    }

    let user_id = UserId(params.user_id);
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
}
