//! Config schema: one section per component, one field per tunable spec.md
//! names a default for (ring sizes, TTLs, thresholds, backoff schedules).

use serde::{Deserialize, Serialize};

/// Root configuration, discovered and loaded by [`crate::loader`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgcoreConfig {
    pub gateway: GatewayConfig,
    pub logic: LogicConfig,
    pub task: TaskConfig,
    pub repo: RepoConfig,
    pub bus: BusConfig,
    pub sessions: SessionsConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub instance_id: String,
    pub max_frame_bytes: usize,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
    pub write_pump_capacity: usize,
    pub write_deadline_ms: u64,
    pub ping_interval_ms: u64,
    pub read_deadline_multiple: u64,
    pub upstream_publish_backoff_ms: Vec<u64>,
    pub bearer_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            instance_id: "gw-local".to_string(),
            max_frame_bytes: msgcore_protocol::MAX_FRAME_BYTES,
            rate_limit_per_sec: msgcore_protocol::RATE_LIMIT_PER_SEC,
            rate_limit_burst: msgcore_protocol::RATE_LIMIT_BURST,
            write_pump_capacity: msgcore_protocol::WRITE_PUMP_CAPACITY,
            write_deadline_ms: msgcore_protocol::WRITE_DEADLINE_MS,
            ping_interval_ms: msgcore_protocol::PING_INTERVAL_MS,
            read_deadline_multiple: msgcore_protocol::READ_DEADLINE_MULTIPLE,
            upstream_publish_backoff_ms: vec![50, 200, 800],
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    pub dedupe_ttl_ms: u64,
    pub large_group_threshold: u64,
    pub persistence_retry_attempts: usize,
    pub persistence_retry_base_ms: u64,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl_ms: msgcore_protocol::DEDUPE_TTL_MS,
            large_group_threshold: msgcore_protocol::LARGE_GROUP_THRESHOLD as u64,
            persistence_retry_attempts: 3,
            persistence_retry_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub page_size: usize,
    pub worker_pool: usize,
    pub max_emit_per_publish: usize,
    pub page_retry_attempts: usize,
    pub page_retry_base_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            page_size: msgcore_protocol::TASK_PAGE_SIZE,
            worker_pool: msgcore_protocol::TASK_WORKER_POOL,
            max_emit_per_publish: msgcore_protocol::MAX_EMIT_PER_PUBLISH,
            page_retry_attempts: 3,
            page_retry_base_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub hot_window_size: usize,
    pub max_get_messages_limit: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            hot_window_size: msgcore_protocol::HOT_WINDOW_SIZE,
            max_get_messages_limit: msgcore_protocol::MAX_GET_MESSAGES_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub upstream_partitions: u32,
    pub downstream_partitions: u32,
    pub task_partitions: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            upstream_partitions: msgcore_protocol::UPSTREAM_PARTITIONS,
            downstream_partitions: msgcore_protocol::DOWNSTREAM_PARTITIONS,
            task_partitions: msgcore_protocol::TASK_PARTITIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub ttl_secs: u64,
    pub refresh_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: msgcore_protocol::SESSION_TTL_SECS,
            refresh_secs: msgcore_protocol::SESSION_REFRESH_SECS,
            sweep_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `sqlx` connection string, e.g. `sqlite://msgcore.db` or `sqlite::memory:`.
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://msgcore.db".to_string(),
        }
    }
}
