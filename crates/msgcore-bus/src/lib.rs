//! MsgBus: topic-partitioned append-only transport, spec §2/§6.
//!
//! `MsgBus` is listed as an external collaborator in spec.md's component
//! table — a real deployment backs it with Kafka/NATS/etc. This crate ships
//! the trait boundary that swap would happen behind, plus the one
//! implementation spec.md's own testable properties (§8) need: an
//! in-process transport with the same partition-assignment and
//! per-partition ordering semantics as a real broker, grounded on
//! moltis-gateway's channel-based per-connection fan-out (`state.rs`'s
//! `ConnectedClient::sender: mpsc::UnboundedSender<String>`, generalized here
//! from "one channel per client" to "one channel per partition").

use std::{
    hash::Hasher,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHasher;
use msgcore_common::Severity;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic '{0}' has no consumer for partition {1} (channel closed or never taken)")]
    Closed(String, u32),
    #[error("partition {1} of topic '{0}' was already claimed by another consumer")]
    AlreadyClaimed(String, u32),
}

impl msgcore_common::severity::Classify for BusError {
    fn severity(&self) -> Severity {
        Severity::Transient
    }
}

/// Stable hash of a routing key into `[0, partitions)`, used by every topic
/// constructor below so the same key always lands on the same partition —
/// the property spec §5 relies on for per-conversation / per-user ordering.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() % partitions as u64) as u32
}

/// One append-only, partitioned topic. `publish` routes by `partition_for`.
#[async_trait]
pub trait Topic: Send + Sync {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), BusError>;
    fn partitions(&self) -> u32;
    fn name(&self) -> &str;
}

/// One partition's consumption handle. Spec §5: "one consumer task owns one
/// partition"; a given partition can only be claimed once.
#[async_trait]
pub trait Consumer: Send {
    /// `None` means the topic was dropped (publishers gone) — the consumer
    /// loop should exit, not retry.
    async fn recv(&mut self) -> Option<(String, Bytes)>;
}

struct PartitionSlot {
    sender: mpsc::Sender<(String, Bytes)>,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<(String, Bytes)>>>,
}

/// In-process topic: one bounded `mpsc` channel per partition. Bounded so a
/// slow consumer creates publish-side backpressure rather than unbounded
/// memory growth, matching the bounded-channel posture spec §5 requires of
/// the Gateway's writePump.
pub struct InProcessTopic {
    name: String,
    partitions: Vec<PartitionSlot>,
}

impl InProcessTopic {
    pub fn new(name: impl Into<String>, partitions: u32, capacity: usize) -> Arc<Self> {
        let slots = (0..partitions)
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity);
                PartitionSlot {
                    sender: tx,
                    receiver: std::sync::Mutex::new(Some(rx)),
                }
            })
            .collect();
        Arc::new(Self {
            name: name.into(),
            partitions: slots,
        })
    }

    /// Take ownership of one partition's receiver. Returns an error if
    /// another consumer already claimed it — mirrors a broker rejecting a
    /// second consumer group member from double-owning a partition.
    pub fn take_partition(&self, partition: u32) -> Result<PartitionConsumer, BusError> {
        let slot = self
            .partitions
            .get(partition as usize)
            .unwrap_or_else(|| panic!("partition {partition} out of range for topic '{}'", self.name));
        let mut guard = slot.receiver.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .take()
            .map(PartitionConsumer)
            .ok_or_else(|| BusError::AlreadyClaimed(self.name.clone(), partition))
    }

    /// Claim every partition this topic owns, for a worker pool that wants
    /// to assign them round-robin across a fixed number of tasks (spec §4.2
    /// "one consumer group member per partition", §4.3 bounded worker pool).
    pub fn take_all_partitions(&self) -> Vec<PartitionConsumer> {
        (0..self.partitions.len() as u32)
            .map(|p| self.take_partition(p).expect("first claim of a fresh topic"))
            .collect()
    }
}

#[async_trait]
impl Topic for InProcessTopic {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), BusError> {
        let partition = partition_for(key, self.partitions.len() as u32);
        let slot = &self.partitions[partition as usize];
        slot.sender
            .send((key.to_string(), payload))
            .await
            .map_err(|_| BusError::Closed(self.name.clone(), partition))
    }

    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct PartitionConsumer(mpsc::Receiver<(String, Bytes)>);

#[async_trait]
impl Consumer for PartitionConsumer {
    async fn recv(&mut self) -> Option<(String, Bytes)> {
        self.0.recv().await
    }
}

/// Guards against double-registration of a gateway instance's downstream
/// topic within one process (tests and the CLI both call
/// `downstream_topic` defensively).
static DOWNSTREAM_WARN_ONCE: AtomicBool = AtomicBool::new(false);

/// `upstream`, N partitions (default 32), keyed by `conversation_id` (spec §6).
pub fn upstream_topic(partitions: u32) -> Arc<InProcessTopic> {
    InProcessTopic::new("upstream", partitions, 1024)
}

/// `downstream-{gateway_instance_id}`, P partitions (default 4), keyed by
/// `user_id` (spec §6).
pub fn downstream_topic(instance_id: &str, partitions: u32) -> Arc<InProcessTopic> {
    if !DOWNSTREAM_WARN_ONCE.swap(true, Ordering::Relaxed) {
        tracing::debug!("first downstream topic created in this process");
    }
    InProcessTopic::new(format!("downstream-{instance_id}"), partitions, 1024)
}

/// `task`, M partitions (default 8), keyed by `conversation_id` (spec §6).
pub fn task_topic(partitions: u32) -> Arc<InProcessTopic> {
    InProcessTopic::new("task", partitions, 512)
}

/// Dead-letter sink for envelopes that exhaust their persistence retry
/// budget (spec §4.2 step 4 / §7 Exhaustion).
pub fn dead_letter_topic() -> Arc<InProcessTopic> {
    InProcessTopic::new("dead-letter", 1, 4096)
}

/// Lazily creates and caches one `downstream-{instance_id}` topic per
/// gateway instance, shared by `msgcore-logic` and `msgcore-task` so both
/// publish to (and a gateway's own startup claims) the same topic instance
/// within one process.
pub struct DownstreamTopics {
    partitions: u32,
    topics: dashmap::DashMap<String, Arc<InProcessTopic>>,
}

impl DownstreamTopics {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            topics: dashmap::DashMap::new(),
        }
    }

    pub fn get_or_create(&self, instance_id: &str) -> Arc<InProcessTopic> {
        Arc::clone(
            self.topics
                .entry(instance_id.to_string())
                .or_insert_with(|| downstream_topic(instance_id, self.partitions)),
        )
    }
}

impl Default for DownstreamTopics {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_for_is_stable() {
        assert_eq!(partition_for("single_abc", 32), partition_for("single_abc", 32));
    }

    #[tokio::test]
    async fn publish_then_recv_round_trips() {
        let topic = upstream_topic(4);
        let key = "single_abc";
        let partition = partition_for(key, 4);
        let mut consumer = topic.take_partition(partition).unwrap();

        topic.publish(key, Bytes::from_static(b"hello")).await.unwrap();
        let (recv_key, payload) = consumer.recv().await.unwrap();
        assert_eq!(recv_key, key);
        assert_eq!(payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn same_key_always_routes_to_same_partition_preserving_order() {
        let topic = upstream_topic(8);
        let key = "group_7";
        let partition = partition_for(key, 8);
        let mut consumer = topic.take_partition(partition).unwrap();

        for i in 0..5u8 {
            topic.publish(key, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            let (_, payload) = consumer.recv().await.unwrap();
            assert_eq!(payload, Bytes::from(vec![i]));
        }
    }

    #[test]
    fn claiming_a_partition_twice_errors() {
        let topic = upstream_topic(1);
        let _first = topic.take_partition(0).unwrap();
        assert!(matches!(topic.take_partition(0), Err(BusError::AlreadyClaimed(_, 0))));
    }
}
