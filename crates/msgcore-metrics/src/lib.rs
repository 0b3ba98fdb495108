//! Metrics facade: a thin wrapper over the `metrics` crate, following
//! `moltis-metrics`'s shape — the recorder is a global, installed once at
//! process start (or never, in which case every call is a documented no-op).
//!
//! Re-exports `metrics`'s own macros so call sites read `msgcore_metrics::counter!(...)`
//! instead of depending on `metrics` directly, keeping the facade swap-in-place
//! if the backing crate ever changes.

#[cfg(feature = "prometheus")]
pub mod prometheus;

pub use metrics::{counter, describe_counter, describe_histogram, gauge, histogram};

/// Metric names used by [Logic], spec §4.2 Observability: one counter per
/// pipeline stage, tagged `stage` and `outcome`.
pub const LOGIC_STAGE_TOTAL: &str = "msgcore_logic_stage_total";

/// Per-conversation-kind processing latency, spec §4.2 Observability.
pub const LOGIC_LATENCY_MS: &str = "msgcore_logic_latency_ms";

/// Per-page fan-out outcome counter, spec §4.3.
pub const TASK_PAGE_TOTAL: &str = "msgcore_task_page_total";

/// Count of sub-batches a task page was rechunked into, spec §4.3.
pub const TASK_RECHUNK_TOTAL: &str = "msgcore_task_rechunk_total";

/// Active WebSocket connections per gateway instance, spec §4.1.
pub const GATEWAY_CONNECTIONS: &str = "msgcore_gateway_connections";

/// Registers human-readable descriptions for every metric this crate emits.
/// Safe to call multiple times; recorders that don't support descriptions
/// ignore it.
pub fn describe() {
    describe_counter!(LOGIC_STAGE_TOTAL, "Logic pipeline stage invocations by stage and outcome");
    describe_histogram!(LOGIC_LATENCY_MS, "Logic per-conversation processing latency in milliseconds");
    describe_counter!(TASK_PAGE_TOTAL, "TaskRunner page fan-out invocations by outcome");
    describe_counter!(TASK_RECHUNK_TOTAL, "TaskRunner sub-batches produced by rechunking an oversized page");
    describe_counter!(GATEWAY_CONNECTIONS, "Gateway WebSocket connection lifecycle events");
}

/// Record one Logic pipeline stage outcome, spec §4.2 Observability.
pub fn record_stage(stage: &'static str, outcome: &'static str) {
    counter!(LOGIC_STAGE_TOTAL, "stage" => stage, "outcome" => outcome).increment(1);
}

/// Record end-to-end per-conversation processing latency.
pub fn record_latency_ms(conversation_kind: &'static str, millis: f64) {
    histogram!(LOGIC_LATENCY_MS, "conversation_kind" => conversation_kind).record(millis);
}

/// Record one TaskRunner page outcome (`"ok"` or `"exhausted"`).
pub fn record_task_page(outcome: &'static str) {
    counter!(TASK_PAGE_TOTAL, "outcome" => outcome).increment(1);
}

/// Record that a page was split into `sub_batches` rechunked publishes.
pub fn record_task_rechunk(sub_batches: u64) {
    counter!(TASK_RECHUNK_TOTAL).increment(sub_batches);
}
