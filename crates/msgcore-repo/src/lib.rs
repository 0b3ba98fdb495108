//! Repo: transactional facade over Store + HotCache + SessionRegistry,
//! spec §4.4.
//!
//! Grounded on `moltis-gateway::services`'s `Arc<dyn Trait>` service-object
//! pattern (`ChatService`/`ModelService` — late-bound trait objects wired
//! once at startup instead of reached through a global), generalized here
//! to the spec's `SaveMessage`/`GetMessages`/`GetConversationList`/
//! `MarkAsRead`/session-pointer RPC surface.

pub mod in_memory;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use msgcore_common::{ConversationId, ConversationKind, GroupId, Severity, UserId, severity::Classify};
use msgcore_hotcache::{Coverage, HotCache};
use msgcore_protocol::{MAX_GET_MESSAGES_LIMIT, envelopes::MessageRecord};
use msgcore_sessions::{SessionPointer, SessionRegistry};
use msgcore_store::{InsertOutcome, SqliteStore, StoreError};
use thiserror::Error;
use tracing::warn;

pub use in_memory::InMemoryRepo;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl Classify for RepoError {
    fn severity(&self) -> Severity {
        match self {
            RepoError::Store(e) => e.severity(),
        }
    }
}

/// Who else is addressed by a conversation, spec §6
/// `GetConversations` `peer_summary` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSummary {
    Single { peer: UserId },
    Group { group_id: GroupId, member_count: u64 },
    World,
}

/// One row of `GetConversationList(user_id)`, spec §4.4.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub last_message: Option<MessageRecord>,
    pub unread_count: u64,
    pub peer_summary: PeerSummary,
}

/// Every RPC spec §4.4 names, as a trait object Logic/Gateway/TaskRunner
/// hold behind `Arc<dyn Repo>` (constructed once at `msgcore-cli` startup,
/// never a process-wide global per spec §9's re-architecture note).
#[async_trait]
pub trait Repo: Send + Sync {
    async fn save_message(&self, msg: MessageRecord, recipients: &[UserId]) -> Result<(), RepoError>;

    async fn get_messages(&self, conversation_id: &ConversationId, from_seq: u64, limit: usize) -> Result<Vec<MessageRecord>, RepoError>;

    async fn get_conversation_list(&self, user: UserId) -> Result<Vec<ConversationSummary>, RepoError>;

    async fn mark_as_read(&self, conversation_id: &ConversationId, user: UserId, up_to_seq: u64) -> Result<(), RepoError>;

    async fn get_session_pointer(&self, user: UserId) -> Option<SessionPointer>;
    async fn set_session_pointer(&self, user: UserId, instance_id: &str, ttl: Duration);
    async fn refresh_session_pointer(&self, user: UserId, ttl: Duration);
    async fn clear_session_pointer(&self, user: UserId, expected_instance_id: &str) -> bool;
    async fn get_session_pointers(&self, users: &[UserId]) -> HashMap<UserId, SessionPointer>;

    async fn get_group_member_count(&self, group_id: &GroupId) -> Result<u64, RepoError>;
    async fn get_group_members_page(&self, group_id: &GroupId, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError>;

    /// Keyset page over every registered user — `world`'s fan-out source
    /// since that conversation kind has no `group_members` row set (spec §3).
    async fn get_all_users_page(&self, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError>;

    /// Single-chat/world participant resolution — used by Logic's fan-out
    /// routing step (spec §4.2 step 5) for the two conversation kinds that
    /// have no `group_members` table.
    async fn get_conversation_participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, RepoError>;

    async fn ensure_conversation_participants(&self, conversation_id: &ConversationId, participants: &[UserId]) -> Result<(), RepoError>;
}

/// Production `Repo`: durable Store writes first, best-effort HotCache
/// mutations second (spec §4.4 "Implementation ordering").
pub struct LiveRepo {
    store: Arc<SqliteStore>,
    hot_cache: Arc<HotCache>,
    sessions: Arc<dyn SessionRegistry>,
}

impl LiveRepo {
    pub fn new(store: Arc<SqliteStore>, hot_cache: Arc<HotCache>, sessions: Arc<dyn SessionRegistry>) -> Self {
        Self {
            store,
            hot_cache,
            sessions,
        }
    }
}

#[async_trait]
impl Repo for LiveRepo {
    async fn save_message(&self, msg: MessageRecord, recipients: &[UserId]) -> Result<(), RepoError> {
        // Durable write first; a unique-constraint hit is treated as an
        // idempotent replay, not a failure (spec §4.4 step 1).
        let outcome = self.store.insert_message(&msg).await?;
        if outcome == InsertOutcome::AlreadyExists {
            return Ok(());
        }

        // Best-effort HotCache mutations. Never fail the call — HotCache is
        // reconstructable from Store (spec §4.4 "Failure semantics").
        let record = Arc::new(msg.clone());
        self.hot_cache.push_message(Arc::clone(&record));
        for recipient in recipients {
            if *recipient == msg.sender_id {
                continue;
            }
            self.hot_cache.increment_unread(&msg.conversation_id, *recipient);
        }
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &ConversationId, from_seq: u64, limit: usize) -> Result<Vec<MessageRecord>, RepoError> {
        let limit = limit.min(MAX_GET_MESSAGES_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        match self.hot_cache.range(conversation_id, from_seq, limit) {
            Coverage::Full(msgs) => Ok(msgs.iter().map(|m| (**m).clone()).collect()),
            Coverage::Partial {
                covered,
                first_covered_seq,
            } => {
                let missing = self
                    .store
                    .get_messages(conversation_id, from_seq, (first_covered_seq - from_seq) as usize)
                    .await?;
                let mut merged = missing;
                merged.extend(covered.iter().map(|m| (**m).clone()));
                merged.truncate(limit);
                Ok(merged)
            },
            Coverage::Empty => {
                let fallback = self.store.get_messages(conversation_id, from_seq, limit).await?;
                if fallback.is_empty() {
                    warn!(%conversation_id, "HotCache miss and Store returned nothing for range");
                }
                Ok(fallback)
            },
        }
    }

    async fn get_conversation_list(&self, user: UserId) -> Result<Vec<ConversationSummary>, RepoError> {
        let conversation_ids = self.store.list_user_conversations(user).await?;

        // Single batched pipeline, not N sequential round-trips (spec §4.4,
        // resolving spec §9's Open Question in favor of the batched RPC).
        let rows = futures::future::try_join_all(conversation_ids.into_iter().map(|conversation_id| {
            let store = Arc::clone(&self.store);
            let hot_cache = Arc::clone(&self.hot_cache);
            async move {
                let Some(meta) = store.get_conversation_meta(&conversation_id).await? else {
                    return Ok::<Option<ConversationSummary>, RepoError>(None);
                };

                let last_message = match hot_cache.top(&conversation_id) {
                    Some(m) => Some((*m).clone()),
                    None => store.get_messages(&conversation_id, meta.last_seq.max(1), 1).await?.into_iter().next(),
                };
                let unread_count = hot_cache.get_unread(&conversation_id, user);

                let peer_summary = match meta.kind {
                    ConversationKind::World => PeerSummary::World,
                    ConversationKind::Group => {
                        let group_id = GroupId(conversation_id.as_str().trim_start_matches("group_").parse().unwrap_or(0));
                        let member_count = store.get_group_member_count(&group_id).await?;
                        PeerSummary::Group { group_id, member_count }
                    },
                    ConversationKind::Single => {
                        let peer = store_single_peer(&store, &conversation_id, user).await?;
                        PeerSummary::Single { peer }
                    },
                };

                Ok(Some(ConversationSummary {
                    conversation_id,
                    last_message,
                    unread_count,
                    peer_summary,
                }))
            }
        }))
        .await?;

        let mut summaries: Vec<ConversationSummary> = rows.into_iter().flatten().collect();
        summaries.sort_by(|a, b| {
            let a_ts = a.last_message.as_ref().map(|m| m.created_at).unwrap_or(0);
            let b_ts = b.last_message.as_ref().map(|m| m.created_at).unwrap_or(0);
            b_ts.cmp(&a_ts)
        });
        Ok(summaries)
    }

    async fn mark_as_read(&self, conversation_id: &ConversationId, user: UserId, up_to_seq: u64) -> Result<(), RepoError> {
        let last_seq = self
            .store
            .get_conversation_meta(conversation_id)
            .await?
            .map(|m| m.last_seq)
            .unwrap_or(0);
        self.hot_cache.mark_read(conversation_id, user, last_seq, up_to_seq);
        Ok(())
    }

    async fn get_session_pointer(&self, user: UserId) -> Option<SessionPointer> {
        self.sessions.get(user).await.ok().flatten()
    }

    async fn set_session_pointer(&self, user: UserId, instance_id: &str, ttl: Duration) {
        let _ = self.sessions.set(user, instance_id, ttl).await;
    }

    async fn refresh_session_pointer(&self, user: UserId, ttl: Duration) {
        let _ = self.sessions.refresh(user, ttl).await;
    }

    async fn clear_session_pointer(&self, user: UserId, expected_instance_id: &str) -> bool {
        self.sessions.clear_if(user, expected_instance_id).await.unwrap_or(false)
    }

    async fn get_session_pointers(&self, users: &[UserId]) -> HashMap<UserId, SessionPointer> {
        self.sessions.get_many(users).await.unwrap_or_default()
    }

    async fn get_group_member_count(&self, group_id: &GroupId) -> Result<u64, RepoError> {
        Ok(self.store.get_group_member_count(group_id).await?)
    }

    async fn get_group_members_page(&self, group_id: &GroupId, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError> {
        Ok(self.store.get_group_members_page(group_id, after_user_id, limit).await?)
    }

    async fn get_all_users_page(&self, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError> {
        Ok(self.store.get_all_users_page(after_user_id, limit).await?)
    }

    async fn get_conversation_participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, RepoError> {
        match ConversationKind::of(conversation_id) {
            ConversationKind::Group => {
                let group_id = GroupId(conversation_id.as_str().trim_start_matches("group_").parse().unwrap_or(0));
                let mut members = Vec::new();
                let mut after = None;
                loop {
                    let page = self.store.get_group_members_page(&group_id, after, 500).await?;
                    if page.is_empty() {
                        break;
                    }
                    after = page.last().copied();
                    members.extend(page);
                }
                Ok(members)
            },
            ConversationKind::Single | ConversationKind::World => {
                // single/world participants are tracked only in
                // `conversation_participants` (spec §3: no membership table
                // for these kinds), populated by `ensure_conversation_participants`.
                let rows: Vec<(i64,)> = sqlx::query_as(
                    "SELECT user_id FROM conversation_participants WHERE conversation_id = ?",
                )
                .bind(conversation_id.as_str())
                .fetch_all(self.store.pool())
                .await
                .map_err(StoreError::Database)?;
                Ok(rows.into_iter().map(|(id,)| UserId(id as u64)).collect())
            },
        }
    }

    async fn ensure_conversation_participants(&self, conversation_id: &ConversationId, participants: &[UserId]) -> Result<(), RepoError> {
        Ok(self.store.ensure_conversation_participants(conversation_id, participants).await?)
    }
}

async fn store_single_peer(store: &SqliteStore, conversation_id: &ConversationId, user: UserId) -> Result<UserId, RepoError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ? AND user_id != ?",
    )
    .bind(conversation_id.as_str())
    .bind(user.0 as i64)
    .fetch_all(store.pool())
    .await
    .map_err(StoreError::Database)?;
    Ok(rows.into_iter().next().map(|(id,)| UserId(id as u64)).unwrap_or(user))
}
