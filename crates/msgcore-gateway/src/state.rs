use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use msgcore_bus::{DownstreamTopics, InProcessTopic};
use msgcore_common::UserId;
use msgcore_config::GatewayConfig;
use msgcore_protocol::ServerFrame;
use msgcore_repo::Repo;
use tokio::sync::{Notify, RwLock, mpsc};

use crate::auth::ResolvedAuth;

pub type ConnId = String;

/// A WebSocket client currently attached to this gateway instance.
pub struct ConnectedClient {
    pub conn_id: ConnId,
    pub user_id: UserId,
    /// Channel feeding this connection's `write_pump`. Bounded
    /// (spec §4.1 `write_pump_capacity`) so a slow client creates
    /// backpressure rather than unbounded memory growth.
    pub sender: mpsc::Sender<ServerFrame>,
    /// Signaled when this connection is force-closed from outside its own
    /// read/write pumps (duplicate login, admin close) so both loops can
    /// select on it alongside their normal recv.
    pub close: Arc<Notify>,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl ConnectedClient {
    /// Non-blocking enqueue. Returns `false` if the channel is full or the
    /// write_pump has exited — callers drop-and-log on failure, matching
    /// spec §4.1's downstream-consumer overflow policy.
    pub fn try_send(&self, frame: ServerFrame) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Shared gateway runtime state, wrapped in `Arc` for use across the HTTP
/// server, read/write pumps, and the downstream-consumer task.
pub struct GatewayState {
    pub instance_id: String,
    pub clients: RwLock<HashMap<ConnId, ConnectedClient>>,
    pub repo: Arc<dyn Repo>,
    /// `upstream`, keyed by `conversation_id` — every `read_pump` publishes here.
    pub upstream_topic: Arc<InProcessTopic>,
    /// Every gateway instance's `downstream-{instance_id}` topic, shared with
    /// `msgcore-logic`/`msgcore-task` within one process so this instance can
    /// both drain its own and publish duplicate-login control events into a
    /// peer's (spec §4.1 "Session acquisition").
    pub downstream_topics: Arc<DownstreamTopics>,
    pub auth: ResolvedAuth,
    pub config: GatewayConfig,
    conn_seq: AtomicU64,
}

impl GatewayState {
    pub fn new(instance_id: impl Into<String>, repo: Arc<dyn Repo>, upstream_topic: Arc<InProcessTopic>, downstream_topics: Arc<DownstreamTopics>, auth: ResolvedAuth, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            clients: RwLock::new(HashMap::new()),
            repo,
            upstream_topic,
            downstream_topics,
            auth,
            config,
            conn_seq: AtomicU64::new(0),
        })
    }

    /// This instance's own downstream topic, drained by its consumer task.
    pub fn own_downstream_topic(&self) -> Arc<InProcessTopic> {
        self.downstream_topics.get_or_create(&self.instance_id)
    }

    /// Mint a connection id unique within this process.
    pub fn next_conn_id(&self) -> ConnId {
        let n = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.instance_id)
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Find the local connection for `user`, if this instance owns one.
    pub async fn conn_id_for_user(&self, user: UserId) -> Option<ConnId> {
        self.clients
            .read()
            .await
            .values()
            .find(|c| c.user_id == user)
            .map(|c| c.conn_id.clone())
    }

    /// Enqueue a frame for delivery to `user`'s local connection, if any.
    /// Returns `true` if a connection was found and the enqueue succeeded.
    pub async fn deliver_local(&self, user: UserId, frame: ServerFrame) -> bool {
        self.clients.read().await.values().find(|c| c.user_id == user).is_some_and(|c| c.try_send(frame))
    }

    /// Force-close the local connection for `user`, if any, without waiting
    /// for its `write_pump` to notice — used when a `CloseSession` control
    /// envelope arrives for a user this instance no longer owns.
    pub async fn close_local(&self, user: UserId) -> Option<ConnectedClient> {
        let conn_id = self.conn_id_for_user(user).await?;
        let client = self.remove_client(&conn_id).await;
        if let Some(client) = &client {
            client.close.notify_waiters();
        }
        client
    }
}
