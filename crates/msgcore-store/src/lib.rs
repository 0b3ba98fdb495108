//! Store: durable message log + conversation/user/group metadata, spec §3/§6.
//!
//! Sqlite via `sqlx`, grounded on moltis-gateway's `sqlx` workspace dependency
//! (`moltis-gateway`, `moltis-cli`). Messages are immutable once persisted —
//! no edit/recall beyond the gap-as-tombstone model (spec Non-goals).

pub mod schema;

use std::time::{SystemTime, UNIX_EPOCH};

use msgcore_common::{ConversationId, ConversationKind, GroupId, MessageId, Severity, UserId, severity::Classify};
use msgcore_protocol::{MAX_GET_MESSAGES_LIMIT, envelopes::MessageRecord};
use thiserror::Error;

pub use schema::ConversationMeta;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Classify for StoreError {
    fn severity(&self) -> Severity {
        Severity::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sqlite-backed implementation of the Store component.
#[derive(Clone)]
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
}

impl SqliteStore {
    pub async fn new(pool: sqlx::SqlitePool) -> Result<Self, StoreError> {
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Insert into `messages`, keyed by `message_id` with a UNIQUE constraint
    /// on `(conversation_id, seq_id)`. A constraint violation is treated as
    /// an idempotent replay, not an error (spec §4.4 step 1).
    pub async fn insert_message(&self, msg: &MessageRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages
                (message_id, conversation_id, sender_id, seq_id, client_msg_id, type, content, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(msg.message_id.0 as i64)
        .bind(msg.conversation_id.as_str())
        .bind(msg.sender_id.0 as i64)
        .bind(msg.seq_id as i64)
        .bind(&msg.client_msg_id)
        .bind(&msg.message_type)
        .bind(&msg.content)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                sqlx::query(
                    "INSERT INTO conversations (conversation_id, kind, last_seq, last_message_id, updated_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(conversation_id) DO UPDATE SET
                        last_seq = excluded.last_seq,
                        last_message_id = excluded.last_message_id,
                        updated_at = excluded.updated_at
                     WHERE excluded.last_seq > conversations.last_seq",
                )
                .bind(msg.conversation_id.as_str())
                .bind(kind_str(ConversationKind::of(&msg.conversation_id)))
                .bind(msg.seq_id as i64)
                .bind(msg.message_id.0 as i64)
                .bind(now_unix())
                .execute(&self.pool)
                .await?;
                Ok(InsertOutcome::Inserted)
            },
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::AlreadyExists)
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let limit = limit.min(MAX_GET_MESSAGES_LIMIT) as i64;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<(i64, i64, i64, String, String, String, i64)> = sqlx::query_as(
            "SELECT message_id, sender_id, seq_id, client_msg_id, type, content, created_at
             FROM messages
             WHERE conversation_id = ? AND seq_id >= ?
             ORDER BY seq_id ASC
             LIMIT ?",
        )
        .bind(conversation_id.as_str())
        .bind(from_seq as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(message_id, sender_id, seq_id, client_msg_id, message_type, content, created_at)| MessageRecord {
                message_id: MessageId(message_id as u64),
                conversation_id: conversation_id.clone(),
                sender_id: UserId(sender_id as u64),
                seq_id: seq_id as u64,
                client_msg_id,
                message_type,
                content,
                created_at,
            })
            .collect())
    }

    pub async fn get_conversation_meta(&self, conversation_id: &ConversationId) -> Result<Option<ConversationMeta>, StoreError> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT kind, last_seq, last_message_id FROM conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(kind, last_seq, last_message_id)| ConversationMeta {
            conversation_id: conversation_id.clone(),
            kind: parse_kind(&kind),
            last_seq: last_seq as u64,
            last_message_id: MessageId(last_message_id as u64),
        }))
    }

    /// Idempotent participant registration. `single` and `world`
    /// conversations have no separate membership table (spec §3 derives
    /// them from the id), so this is how Logic/Repo make a participant set
    /// queryable for conversation-list reads.
    pub async fn ensure_conversation_participants(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
    ) -> Result<(), StoreError> {
        for user in participants {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
            )
            .bind(conversation_id.as_str())
            .bind(user.0 as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_user_conversations(&self, user: UserId) -> Result<Vec<ConversationId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT conversation_id FROM conversation_participants WHERE user_id = ?")
                .bind(user.0 as i64)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| ConversationId(id)).collect())
    }

    pub async fn create_group(&self, owner: UserId, members: &[UserId]) -> Result<GroupId, StoreError> {
        let now = now_unix();
        let group_id: i64 = sqlx::query_scalar(
            "INSERT INTO groups (owner_user_id, member_count, created_at, updated_at)
             VALUES (?, ?, ?, ?) RETURNING group_id",
        )
        .bind(owner.0 as i64)
        .bind(members.len() as i64)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        for member in members {
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id, role) VALUES (?, ?, ?)")
                .bind(group_id)
                .bind(member.0 as i64)
                .bind(if *member == owner { "owner" } else { "member" })
                .execute(&self.pool)
                .await?;
        }

        let conv = ConversationId::group(GroupId(group_id as u64));
        self.ensure_conversation_participants(&conv, members).await?;
        Ok(GroupId(group_id as u64))
    }

    pub async fn get_group_member_count(&self, group_id: &GroupId) -> Result<u64, StoreError> {
        let count: Option<i64> = sqlx::query_scalar("SELECT member_count FROM groups WHERE group_id = ?")
            .bind(group_id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(count.unwrap_or(0) as u64)
    }

    /// Keyset-paginated listing of every registered user, used the same way
    /// `get_group_members_page` is but for the `world` conversation, whose
    /// membership is "every user" rather than a `group_members` row set.
    pub async fn get_all_users_page(&self, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, StoreError> {
        let after = after_user_id.map(|u| u.0 as i64).unwrap_or(-1);
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM users WHERE user_id > ? ORDER BY user_id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| UserId(id as u64)).collect())
    }

    /// Keyset-paginated member listing, spec §4.3 (default page size 500).
    pub async fn get_group_members_page(
        &self,
        group_id: &GroupId,
        after_user_id: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<UserId>, StoreError> {
        let after = after_user_id.map(|u| u.0 as i64).unwrap_or(-1);
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM group_members WHERE group_id = ? AND user_id > ?
             ORDER BY user_id ASC LIMIT ?",
        )
        .bind(group_id.0 as i64)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| UserId(id as u64)).collect())
    }
}

fn kind_str(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Single => "single",
        ConversationKind::Group => "group",
        ConversationKind::World => "world",
    }
}

fn parse_kind(s: &str) -> ConversationKind {
    match s {
        "group" => ConversationKind::Group,
        "world" => ConversationKind::World,
        _ => ConversationKind::Single,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::new(pool).await.unwrap()
    }

    fn msg(conv: &ConversationId, seq: u64, client_msg_id: &str) -> MessageRecord {
        MessageRecord {
            message_id: MessageId(seq * 1000),
            conversation_id: conv.clone(),
            sender_id: UserId(1),
            seq_id: seq,
            client_msg_id: client_msg_id.to_string(),
            message_type: "text".to_string(),
            content: "hi".to_string(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let store = test_store().await;
        let conv = ConversationId::single(UserId(100), UserId(200));
        let record = msg(&conv, 1, "cm-1");

        assert_eq!(store.insert_message(&record).await.unwrap(), InsertOutcome::Inserted);
        let fetched = store.get_messages(&conv, 1, 1).await.unwrap();
        assert_eq!(fetched, vec![record]);

        let meta = store.get_conversation_meta(&conv).await.unwrap().unwrap();
        assert_eq!(meta.last_seq, 1);
    }

    #[tokio::test]
    async fn duplicate_seq_is_idempotent_success() {
        let store = test_store().await;
        let conv = ConversationId::world();
        let record = msg(&conv, 1, "cm-1");
        assert_eq!(store.insert_message(&record).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_message(&record).await.unwrap(), InsertOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn limit_zero_returns_empty() {
        let store = test_store().await;
        let conv = ConversationId::world();
        store.insert_message(&msg(&conv, 1, "cm-1")).await.unwrap();
        assert!(store.get_messages(&conv, 1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn from_seq_beyond_last_seq_returns_empty_not_error() {
        let store = test_store().await;
        let conv = ConversationId::world();
        store.insert_message(&msg(&conv, 1, "cm-1")).await.unwrap();
        assert!(store.get_messages(&conv, 500, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_member_paging_and_threshold() {
        let store = test_store().await;
        let owner = UserId(1);
        let members: Vec<UserId> = (1..=600).map(UserId).collect();
        let group_id = store.create_group(owner, &members).await.unwrap();

        assert_eq!(store.get_group_member_count(&group_id).await.unwrap(), 600);

        let page1 = store.get_group_members_page(&group_id, None, 500).await.unwrap();
        assert_eq!(page1.len(), 500);
        let page2 = store
            .get_group_members_page(&group_id, page1.last().copied(), 500)
            .await
            .unwrap();
        assert_eq!(page2.len(), 100);
    }
}
