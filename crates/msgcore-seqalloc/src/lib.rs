//! SeqAllocator: single monotonic counter per conversation, spec §4.5.
//!
//! Contention is bounded by per-conversation parallelism (naturally low,
//! since a conversation's upstream partition feeds exactly one Logic
//! worker). No gap tolerance is required of the allocator itself — gaps
//! only appear downstream when an allocated `seq_id` is burned (spec §4.2).

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use msgcore_common::{ConversationId, Severity, severity::Classify};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeqAllocError {
    #[error("store error: {0}")]
    Store(String),
}

impl Classify for SeqAllocError {
    fn severity(&self) -> Severity {
        Severity::Transient
    }
}

#[async_trait]
pub trait SeqAllocator: Send + Sync {
    /// Atomically increment and return the new `seq_id` for `conversation`.
    async fn increment(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError>;

    /// Current value without incrementing (used by fan-out/read paths that
    /// need `last_seq` without burning a sequence number).
    async fn current(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError>;
}

/// `DashMap<ConversationId, AtomicU64>` backed allocator. Used by tests and
/// by `msgcore-repo`'s in-memory test double; survives process restarts only
/// as long as the process does not restart, so production deployments
/// should prefer [`SqliteSeqAllocator`].
#[derive(Default)]
pub struct InMemorySeqAllocator {
    counters: DashMap<ConversationId, Arc<AtomicU64>>,
}

impl InMemorySeqAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_for(&self, conversation: &ConversationId) -> Arc<AtomicU64> {
        Arc::clone(
            self.counters
                .entry(conversation.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }
}

#[async_trait]
impl SeqAllocator for InMemorySeqAllocator {
    async fn increment(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError> {
        Ok(self.counter_for(conversation).fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn current(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError> {
        Ok(self.counter_for(conversation).load(Ordering::SeqCst))
    }
}

/// Sqlite-backed allocator: counters survive process restarts (spec §4.5).
/// Grounded on moltis-gateway's `sqlx` workspace dependency.
pub struct SqliteSeqAllocator {
    pool: sqlx::SqlitePool,
}

impl SqliteSeqAllocator {
    pub async fn new(pool: sqlx::SqlitePool) -> Result<Self, SeqAllocError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS seq_counters (
                conversation_id TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| SeqAllocError::Store(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SeqAllocator for SqliteSeqAllocator {
    async fn increment(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SeqAllocError::Store(e.to_string()))?;

        sqlx::query(
            "INSERT INTO seq_counters (conversation_id, value) VALUES (?, 1)
             ON CONFLICT(conversation_id) DO UPDATE SET value = value + 1",
        )
        .bind(conversation.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| SeqAllocError::Store(e.to_string()))?;

        let value: i64 = sqlx::query_scalar("SELECT value FROM seq_counters WHERE conversation_id = ?")
            .bind(conversation.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| SeqAllocError::Store(e.to_string()))?;

        tx.commit().await.map_err(|e| SeqAllocError::Store(e.to_string()))?;
        Ok(value as u64)
    }

    async fn current(&self, conversation: &ConversationId) -> Result<u64, SeqAllocError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM seq_counters WHERE conversation_id = ?")
            .bind(conversation.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SeqAllocError::Store(e.to_string()))?;
        Ok(value.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_allocator_increments_per_conversation() {
        let alloc = InMemorySeqAllocator::new();
        let c1 = ConversationId::world();
        let c2 = ConversationId::group(msgcore_common::GroupId(1));

        assert_eq!(alloc.increment(&c1).await.unwrap(), 1);
        assert_eq!(alloc.increment(&c1).await.unwrap(), 2);
        assert_eq!(alloc.increment(&c2).await.unwrap(), 1);
        assert_eq!(alloc.current(&c1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sqlite_allocator_survives_separate_handles_to_same_pool() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let alloc = SqliteSeqAllocator::new(pool).await.unwrap();
        let conv = ConversationId::single(msgcore_common::UserId(1), msgcore_common::UserId(2));
        assert_eq!(alloc.increment(&conv).await.unwrap(), 1);
        assert_eq!(alloc.increment(&conv).await.unwrap(), 2);
        assert_eq!(alloc.current(&conv).await.unwrap(), 2);
    }
}
