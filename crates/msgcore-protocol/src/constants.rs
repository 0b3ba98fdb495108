/// Wire protocol version exchanged on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum upstream client frame size, spec §4.1 / §8 boundary test.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Idempotency key TTL, spec §4.2 step 1 / §3 DedupKey.
pub const DEDUPE_TTL_MS: u64 = 60_000;

/// Bound on the in-process dedup table before oldest-entry eviction kicks in.
pub const DEDUPE_MAX_ENTRIES: usize = 1_000_000;

/// Default recent-message window size per conversation, spec §3 HotWindow.
pub const HOT_WINDOW_SIZE: usize = 300;

/// Above this member count a group routes through the task topic instead of
/// direct fan-out, spec §4.2 step 5.
pub const LARGE_GROUP_THRESHOLD: usize = 500;

/// TaskRunner member-list page size, spec §4.3.
pub const TASK_PAGE_SIZE: usize = 500;

/// TaskRunner bounded worker pool size, spec §4.3.
pub const TASK_WORKER_POOL: usize = 8;

/// Max downstream records per single publish to one gateway instance before
/// TaskRunner rechunks, spec §4.3.
pub const MAX_EMIT_PER_PUBLISH: usize = 200;

/// `GetMessages` result clamp, spec §4.4.
pub const MAX_GET_MESSAGES_LIMIT: usize = 100;

/// SessionPointer TTL / refresh interval, spec §4.5.
pub const SESSION_TTL_SECS: u64 = 90;
pub const SESSION_REFRESH_SECS: u64 = 30;

/// Gateway write-pump channel capacity, spec §4.1.
pub const WRITE_PUMP_CAPACITY: usize = 1024;

/// Gateway ping interval / read deadline multiple, spec §4.1.
pub const PING_INTERVAL_MS: u64 = 30_000;
pub const READ_DEADLINE_MULTIPLE: u64 = 3;

/// Gateway write deadline, spec §4.1.
pub const WRITE_DEADLINE_MS: u64 = 10_000;

/// Per-session rate limit, spec §4.1.
pub const RATE_LIMIT_PER_SEC: u32 = 30;
pub const RATE_LIMIT_BURST: u32 = 60;

/// Upstream/downstream/task topic partition counts, spec §6.
pub const UPSTREAM_PARTITIONS: u32 = 32;
pub const DOWNSTREAM_PARTITIONS: u32 = 4;
pub const TASK_PARTITIONS: u32 = 8;
