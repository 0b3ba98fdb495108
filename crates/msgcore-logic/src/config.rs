use std::time::Duration;

use msgcore_common::retry::Backoff;
use msgcore_protocol::{DEDUPE_TTL_MS, LARGE_GROUP_THRESHOLD};

/// Tunables for one [`crate::worker::LogicWorker`], spec §4.2.
#[derive(Debug, Clone)]
pub struct LogicConfig {
    pub dedupe_ttl: Duration,
    pub large_group_threshold: u64,
    pub persistence_retry: Backoff,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl: Duration::from_millis(DEDUPE_TTL_MS),
            large_group_threshold: LARGE_GROUP_THRESHOLD as u64,
            persistence_retry: Backoff::exponential(3, Duration::from_millis(50)),
        }
    }
}
