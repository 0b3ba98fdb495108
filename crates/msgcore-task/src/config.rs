use msgcore_common::retry::Backoff;
use msgcore_protocol::{MAX_EMIT_PER_PUBLISH, TASK_PAGE_SIZE, TASK_WORKER_POOL};
use std::time::Duration;

/// Tunables for one [`crate::worker::TaskWorker`], spec §4.3.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub page_size: usize,
    pub worker_pool: usize,
    pub max_emit_per_publish: usize,
    pub page_retry: Backoff,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            page_size: TASK_PAGE_SIZE,
            worker_pool: TASK_WORKER_POOL,
            max_emit_per_publish: MAX_EMIT_PER_PUBLISH,
            page_retry: Backoff::exponential(3, Duration::from_millis(100)),
        }
    }
}
