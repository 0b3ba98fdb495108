//! Dedup: short-lived idempotency key store, spec §3/§4.2.
//!
//! Directly grounded on `moltis-gateway::state::DedupeCache` — same
//! evict-on-access, bounded-size, oldest-wins eviction shape — made
//! `async`-safe and keyed by `client_msg_id` at the Logic tier instead of by
//! broadcast sequence at the Gateway tier.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use msgcore_protocol::{DEDUPE_MAX_ENTRIES, DEDUPE_TTL_MS};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DedupError {}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically check-and-insert. Returns `true` if `key` was newly
    /// inserted (not a duplicate), `false` if it was already present.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError>;

    /// Release a key, e.g. after a persistence failure so the envelope is
    /// treated as new on the next retry (spec §4.2 step 4).
    async fn remove(&self, key: &str);
}

struct Entry {
    inserted_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// In-process TTL table, default max `DEDUPE_MAX_ENTRIES` with oldest-entry
/// eviction once full — the production deployment target per spec §4.2 is a
/// single logical Logic worker per conversation partition, so an
/// in-process table scoped to that worker is sufficient; a cluster-wide
/// dedup store is a drop-in alternative behind the same trait.
pub struct InProcessDedup {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl Default for InProcessDedup {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessDedup {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl: Duration::from_millis(DEDUPE_TTL_MS),
            max_entries: DEDUPE_MAX_ENTRIES,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    async fn evict_expired(&self, now: Instant) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, v| !v.is_expired(now));
    }
}

#[async_trait]
impl DedupStore for InProcessDedup {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
        let now = Instant::now();
        self.evict_expired(now).await;

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }

        if entries.len() >= self.max_entries
            && let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest_key);
        }

        entries.insert(
            key.to_string(),
            Entry {
                inserted_at: now,
                ttl,
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_insert_succeeds_second_is_duplicate() {
        let dedup = InProcessDedup::new();
        let ttl = dedup.default_ttl();
        assert!(dedup.set_if_absent("cm-1", ttl).await.unwrap());
        assert!(!dedup.set_if_absent("cm-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_key_is_treated_as_new() {
        let dedup = InProcessDedup::new();
        assert!(dedup.set_if_absent("cm-1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dedup.set_if_absent("cm-1", Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn remove_allows_immediate_replay() {
        let dedup = InProcessDedup::new();
        let ttl = dedup.default_ttl();
        assert!(dedup.set_if_absent("cm-1", ttl).await.unwrap());
        dedup.remove("cm-1").await;
        assert!(dedup.set_if_absent("cm-1", ttl).await.unwrap());
    }
}
