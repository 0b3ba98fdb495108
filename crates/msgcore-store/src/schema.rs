//! Sqlite schema and migration for the Store component, spec §6.
//!
//! `conversation_participants` is not named explicitly in spec §6's
//! conceptual layout but is required to answer `GetConversations(user_id)`
//! without scanning every message row; `single`/`world` conversations have
//! no membership table of their own (spec §3), so this table is populated
//! lazily by [`crate::SqliteStore::ensure_conversation_participants`] the
//! first time a conversation is touched.

use msgcore_common::{ConversationId, ConversationKind, MessageId};

use crate::StoreError;

/// Row shape for `conversations`, spec §3 Conversation entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMeta {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub last_seq: u64,
    pub last_message_id: MessageId,
}

pub async fn migrate(pool: &sqlx::SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            user_id             INTEGER PRIMARY KEY,
            username            TEXT NOT NULL UNIQUE,
            credential_verifier TEXT NOT NULL,
            profile_blob        TEXT NOT NULL DEFAULT '',
            created_at          INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS groups (
            group_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_user_id INTEGER NOT NULL,
            member_count  INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS group_members (
            group_id INTEGER NOT NULL,
            user_id  INTEGER NOT NULL,
            role     TEXT NOT NULL DEFAULT 'member',
            PRIMARY KEY (group_id, user_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            kind            TEXT NOT NULL,
            last_seq        INTEGER NOT NULL DEFAULT 0,
            last_message_id INTEGER NOT NULL DEFAULT 0,
            updated_at      INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL,
            user_id         INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversation_participants_user
         ON conversation_participants(user_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id      INTEGER PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_id       INTEGER NOT NULL,
            seq_id          INTEGER NOT NULL,
            client_msg_id   TEXT NOT NULL,
            type            TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            UNIQUE(conversation_id, seq_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
         ON messages(conversation_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
