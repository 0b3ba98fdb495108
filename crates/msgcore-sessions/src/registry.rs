use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use dashmap::DashMap;
use msgcore_common::UserId;
use msgcore_protocol::{
    SESSION_TTL_SECS,
    envelopes::{DownstreamEnvelope, DownstreamPayload},
};
use thiserror::Error;
use tracing::debug;

use crate::pointer::SessionPointer;

#[derive(Debug, Error)]
pub enum SessionRegistryError {}

/// Session pointer RPCs, spec §4.4 "Session pointer RPCs" / §4.5
/// SessionRegistry.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn get(&self, user: UserId) -> Result<Option<SessionPointer>, SessionRegistryError>;

    async fn set(&self, user: UserId, instance_id: &str, ttl: Duration) -> Result<(), SessionRegistryError>;

    /// Refresh the TTL of an existing pointer, keep-alive per spec §4.1/§4.5.
    /// No-op if the user has no pointer (it already expired or never connected).
    async fn refresh(&self, user: UserId, ttl: Duration) -> Result<(), SessionRegistryError>;

    /// CAS clear: only removes the pointer if it still names `expected_instance_id`
    /// (spec §4.4 `ClearSessionPointer`). Returns whether it cleared anything.
    async fn clear_if(&self, user: UserId, expected_instance_id: &str) -> Result<bool, SessionRegistryError>;

    /// Batched variant, spec §4.4 `GetSessionPointers` — resolves spec §9's
    /// Open Question (Logic aggregates vs. Repo has a dedicated batched RPC)
    /// in favor of the batched RPC, documented in DESIGN.md.
    async fn get_many(&self, users: &[UserId]) -> Result<HashMap<UserId, SessionPointer>, SessionRegistryError>;
}

/// `DashMap`-backed directory with a background sweep reaping expired
/// pointers, grounded on moltis-gateway's `broadcast_tick` interval-loop shape
/// (`moltis-gateway::server`) generalized from "tick every client" to
/// "sweep every entry".
pub struct InProcessSessionRegistry {
    pointers: Arc<DashMap<UserId, SessionPointer>>,
    default_ttl: Duration,
}

impl InProcessSessionRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            pointers: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    /// Spawn the TTL sweep task. Returns a handle the caller should abort on
    /// shutdown; not started automatically so tests can drive expiry by hand.
    pub fn spawn_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pointers = Arc::clone(&self.pointers);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = SystemTime::now();
                let before = pointers.len();
                pointers.retain(|_, ptr| !ptr.is_expired(now));
                let reaped = before - pointers.len();
                if reaped > 0 {
                    debug!(reaped, "swept expired session pointers");
                }
            }
        })
    }
}

impl Default for InProcessSessionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(SESSION_TTL_SECS))
    }
}

#[async_trait]
impl SessionRegistry for InProcessSessionRegistry {
    async fn get(&self, user: UserId) -> Result<Option<SessionPointer>, SessionRegistryError> {
        let now = SystemTime::now();
        Ok(self.pointers.get(&user).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.clone())
            }
        }))
    }

    async fn set(&self, user: UserId, instance_id: &str, ttl: Duration) -> Result<(), SessionRegistryError> {
        self.pointers
            .insert(user, SessionPointer::new(instance_id, SystemTime::now(), ttl));
        Ok(())
    }

    async fn refresh(&self, user: UserId, ttl: Duration) -> Result<(), SessionRegistryError> {
        if let Some(mut entry) = self.pointers.get_mut(&user) {
            *entry = entry.refreshed(SystemTime::now(), ttl);
        }
        Ok(())
    }

    async fn clear_if(&self, user: UserId, expected_instance_id: &str) -> Result<bool, SessionRegistryError> {
        let removed = self
            .pointers
            .remove_if(&user, |_, ptr| ptr.gateway_instance_id == expected_instance_id)
            .is_some();
        Ok(removed)
    }

    async fn get_many(&self, users: &[UserId]) -> Result<HashMap<UserId, SessionPointer>, SessionRegistryError> {
        let now = SystemTime::now();
        Ok(users
            .iter()
            .filter_map(|u| {
                self.pointers.get(u).and_then(|entry| {
                    if entry.is_expired(now) {
                        None
                    } else {
                        Some((*u, entry.clone()))
                    }
                })
            })
            .collect())
    }
}

/// Groups resolved pointers by gateway instance, the shape Logic's fan-out
/// emission step (spec §4.2 step 6) and TaskRunner's page emission (spec
/// §4.3) both need.
pub fn group_by_instance(pointers: &HashMap<UserId, SessionPointer>) -> HashMap<String, Vec<UserId>> {
    let mut groups: HashMap<String, Vec<UserId>> = HashMap::new();
    for (user, ptr) in pointers {
        groups.entry(ptr.gateway_instance_id.clone()).or_default().push(*user);
    }
    groups
}

/// Build one [`DownstreamEnvelope`] per target user for a resolved instance
/// group — shared helper so Logic and TaskRunner don't each reinvent it.
pub fn envelopes_for(users: &[UserId], message_record: &msgcore_protocol::envelopes::MessageRecord, trace_id: &str) -> Vec<DownstreamEnvelope> {
    users
        .iter()
        .map(|u| DownstreamEnvelope {
            target_user_id: *u,
            trace_id: trace_id.to_string(),
            payload: DownstreamPayload::Message(message_record.clone()),
        })
        .collect()
}

/// Build the duplicate-login control envelope a gateway instance publishes
/// to another instance's downstream topic to ask it to drop a stale
/// connection for `user` (spec §4.1 "Session acquisition").
pub fn close_session_envelope(user: UserId, trace_id: &str) -> DownstreamEnvelope {
    DownstreamEnvelope {
        target_user_id: user,
        trace_id: trace_id.to_string(),
        payload: DownstreamPayload::CloseSession,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let registry = InProcessSessionRegistry::default();
        registry.set(UserId(100), "gw-a", Duration::from_secs(90)).await.unwrap();
        let ptr = registry.get(UserId(100)).await.unwrap().unwrap();
        assert_eq!(ptr.gateway_instance_id, "gw-a");
    }

    #[tokio::test]
    async fn expired_pointer_reads_as_absent() {
        let registry = InProcessSessionRegistry::default();
        registry.set(UserId(100), "gw-a", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.get(UserId(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_if_is_a_compare_and_swap() {
        let registry = InProcessSessionRegistry::default();
        registry.set(UserId(100), "gw-a", Duration::from_secs(90)).await.unwrap();

        assert!(!registry.clear_if(UserId(100), "gw-b").await.unwrap());
        assert!(registry.get(UserId(100)).await.unwrap().is_some());

        assert!(registry.clear_if(UserId(100), "gw-a").await.unwrap());
        assert!(registry.get(UserId(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_many_is_batched_and_skips_missing() {
        let registry = InProcessSessionRegistry::default();
        registry.set(UserId(1), "gw-a", Duration::from_secs(90)).await.unwrap();
        registry.set(UserId(2), "gw-b", Duration::from_secs(90)).await.unwrap();

        let result = registry.get_many(&[UserId(1), UserId(2), UserId(3)]).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[&UserId(1)].gateway_instance_id, "gw-a");
    }

    #[test]
    fn group_by_instance_partitions_users() {
        let mut pointers = HashMap::new();
        pointers.insert(UserId(1), SessionPointer::new("gw-a", SystemTime::now(), Duration::from_secs(90)));
        pointers.insert(UserId(2), SessionPointer::new("gw-a", SystemTime::now(), Duration::from_secs(90)));
        pointers.insert(UserId(3), SessionPointer::new("gw-b", SystemTime::now(), Duration::from_secs(90)));

        let groups = group_by_instance(&pointers);
        assert_eq!(groups["gw-a"].len(), 2);
        assert_eq!(groups["gw-b"].len(), 1);
    }
}
