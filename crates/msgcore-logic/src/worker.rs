//! LogicWorker: the ingress pipeline, spec §4.2.
//!
//! One worker owns exactly one `upstream` partition's [`PartitionConsumer`],
//! mirroring spec §4.2's "one consumer group member per partition" —
//! per-conversation ordering only holds if a single worker ever touches a
//! given partition at a time.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use msgcore_bus::{BusError, Consumer, DownstreamTopics, InProcessTopic, PartitionConsumer, Topic};
use msgcore_common::{
    ConversationId, ConversationKind, UserId,
    retry::retry_with_backoff,
};
use msgcore_dedup::DedupStore;
use msgcore_idgen::IdGenerator;
use msgcore_metrics::{record_latency_ms, record_stage};
use msgcore_protocol::envelopes::{MessageRecord, TaskEnvelope, UpstreamEnvelope};
use msgcore_repo::Repo;
use msgcore_seqalloc::SeqAllocator;
use msgcore_sessions::registry::{envelopes_for, group_by_instance};
use tracing::{Instrument, error, info_span, warn};

use crate::config::LogicConfig;

pub struct LogicWorker {
    consumer: PartitionConsumer,
    repo: Arc<dyn Repo>,
    dedup: Arc<dyn DedupStore>,
    seqalloc: Arc<dyn SeqAllocator>,
    idgen: Arc<IdGenerator>,
    downstream_topics: Arc<DownstreamTopics>,
    task_topic: Arc<InProcessTopic>,
    dead_letter: Arc<InProcessTopic>,
    config: LogicConfig,
}

impl LogicWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: PartitionConsumer,
        repo: Arc<dyn Repo>,
        dedup: Arc<dyn DedupStore>,
        seqalloc: Arc<dyn SeqAllocator>,
        idgen: Arc<IdGenerator>,
        downstream_topics: Arc<DownstreamTopics>,
        task_topic: Arc<InProcessTopic>,
        dead_letter: Arc<InProcessTopic>,
        config: LogicConfig,
    ) -> Self {
        Self {
            consumer,
            repo,
            dedup,
            seqalloc,
            idgen,
            downstream_topics,
            task_topic,
            dead_letter,
            config,
        }
    }

    /// Drains the owned partition until the topic is dropped. Each envelope
    /// is processed to completion (or dead-lettered) before the next `recv`
    /// — spec §4.2's per-partition ordering guarantee depends on this being
    /// strictly sequential, never `tokio::spawn`ed off per-message.
    pub async fn run(mut self) {
        while let Some((_key, payload)) = self.consumer.recv().await {
            if let Err(err) = self.handle_payload(payload).await {
                error!(error = %err, "dropping malformed upstream payload");
            }
        }
    }

    async fn handle_payload(&self, payload: Bytes) -> Result<(), crate::error::LogicError> {
        let envelope: UpstreamEnvelope = serde_json::from_slice(&payload)?;
        let span = info_span!(
            "logic_process_envelope",
            trace_id = %envelope.trace_id,
            client_msg_id = %envelope.client_msg_id,
            conversation_id = %envelope.conversation_id,
        );
        self.process_envelope(envelope).instrument(span).await
    }

    /// The seven-step pipeline: dedup, seq allocation, id generation,
    /// persistence, fan-out routing, downstream emission, offset commit.
    pub async fn process_envelope(&self, envelope: UpstreamEnvelope) -> Result<(), crate::error::LogicError> {
        let started = Instant::now();
        let conversation_id = ConversationId(envelope.conversation_id.clone());
        let kind = ConversationKind::of(&conversation_id);
        let dedupe_key = format!("{}:{}", envelope.sender_user_id, envelope.client_msg_id);

        // Step 1: idempotency check.
        let is_new = self.dedup.set_if_absent(&dedupe_key, self.config.dedupe_ttl).await?;
        if !is_new {
            record_stage("dedup", "duplicate");
            return Ok(());
        }

        // Step 2: sequence allocation. A single conversation's increments
        // are cheap and rarely contended (spec §4.5), so exhaustion here is
        // treated the same as a persistence exhaustion: dead-letter, don't
        // burn a seq that was never actually allocated.
        let seq_id = match retry_with_backoff(&self.config.persistence_retry, || self.seqalloc.increment(&conversation_id)).await {
            Ok(seq_id) => seq_id,
            Err(err) => {
                record_stage("seq_alloc", "exhausted");
                self.dedup.remove(&dedupe_key).await;
                self.dead_letter(&envelope, &format!("sequence allocation exhausted: {err}")).await;
                return Ok(());
            },
        };

        // Step 3: id generation. `seq_id` is already burned at this point —
        // on failure the gap is permanent (spec §4.2 step 4 "burned seq").
        let message_id = match self.idgen.next() {
            Ok(id) => id,
            Err(err) => {
                record_stage("id_gen", "exhausted");
                self.dedup.remove(&dedupe_key).await;
                self.dead_letter(&envelope, &format!("id generation failed: {err}")).await;
                return Ok(());
            },
        };

        let record = MessageRecord {
            message_id,
            conversation_id: conversation_id.clone(),
            sender_id: envelope.sender_user_id,
            seq_id,
            client_msg_id: envelope.client_msg_id.clone(),
            message_type: envelope.message_type.clone(),
            content: envelope.content.clone(),
            created_at: envelope.received_at,
        };

        // Register a `single_` pair the first time its peer is learned —
        // see `ClientFrame::peer_user_id`'s doc comment for why this can't
        // be derived from `conversation_id` alone.
        if kind == ConversationKind::Single
            && let Some(peer) = envelope.peer_user_id
            && let Err(err) = self
                .repo
                .ensure_conversation_participants(&conversation_id, &[envelope.sender_user_id, peer])
                .await
        {
            warn!(error = %err, "failed to register single-conversation participants, continuing without them");
        }

        let recipients = self.resolve_recipients(&conversation_id, kind, envelope.sender_user_id).await;

        // Step 4: persistence, retried; exhaustion releases the dedup key
        // and dead-letters rather than blocking the partition forever.
        let persisted = retry_with_backoff(&self.config.persistence_retry, || {
            self.repo.save_message(record.clone(), &recipients)
        })
        .await;
        if let Err(err) = persisted {
            record_stage("persist", "exhausted");
            self.dedup.remove(&dedupe_key).await;
            self.dead_letter(&envelope, &format!("persistence exhausted: {err}")).await;
            return Ok(());
        }
        record_stage("persist", "ok");

        // Step 5/6: fan-out routing and downstream emission.
        self.route_and_emit(kind, &conversation_id, &record, recipients, &envelope.trace_id).await;

        record_latency_ms(kind_label(kind), started.elapsed().as_millis() as f64);
        // Step 7: offset commit is implicit — `InProcessTopic` has no replay
        // log, so returning here is the commit. A broker-backed `Consumer`
        // would commit its offset at this point instead.
        Ok(())
    }

    /// Single/group: participants table or group roster. World: Logic
    /// itself never materializes the full member list (that's Task's job
    /// once routed) — only the sender is returned, which is enough for
    /// `save_message`'s own-message unread-skip.
    async fn resolve_recipients(&self, conversation_id: &ConversationId, kind: ConversationKind, sender: UserId) -> Vec<UserId> {
        match kind {
            ConversationKind::Single | ConversationKind::Group => self
                .repo
                .get_conversation_participants(conversation_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "failed to resolve conversation participants, fanning out to nobody");
                    Vec::new()
                }),
            ConversationKind::World => vec![sender],
        }
    }

    async fn route_and_emit(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        record: &MessageRecord,
        recipients: Vec<UserId>,
        trace_id: &str,
    ) {
        let routes_through_task = match kind {
            ConversationKind::World => true,
            ConversationKind::Group => match self.repo.get_group_member_count(&group_id_of(conversation_id)).await {
                Ok(count) => count > self.config.large_group_threshold,
                Err(err) => {
                    warn!(error = %err, "failed to read group member count, defaulting to task-routed fan-out");
                    true
                },
            },
            ConversationKind::Single => false,
        };

        if routes_through_task {
            let task_envelope = TaskEnvelope {
                message_record: record.clone(),
                conversation_id: conversation_id.clone(),
                seq_id: record.seq_id,
                sender_id: record.sender_id,
                trace_id: trace_id.to_string(),
            };
            match serde_json::to_vec(&task_envelope) {
                Ok(bytes) => {
                    if let Err(err) = self.task_topic.publish(conversation_id.as_str(), Bytes::from(bytes)).await {
                        error!(error = %err, "failed to publish task envelope; large fan-out dropped for this message");
                    }
                },
                Err(err) => error!(error = %err, "failed to encode task envelope"),
            }
            return;
        }

        let targets: Vec<UserId> = recipients.into_iter().filter(|u| *u != record.sender_id).collect();
        if targets.is_empty() {
            return;
        }
        let pointers = self.repo.get_session_pointers(&targets).await;
        let groups = group_by_instance(&pointers);
        for (instance_id, users) in groups {
            let topic = self.downstream_topics.get_or_create(&instance_id);
            for downstream in envelopes_for(&users, record, trace_id) {
                if let Err(err) = self.publish_downstream(&topic, &downstream).await {
                    warn!(error = %err, target = %downstream.target_user_id, "downstream publish failed, recipient falls back to a catch-up read");
                }
            }
        }
    }

    async fn publish_downstream(&self, topic: &InProcessTopic, envelope: &msgcore_protocol::envelopes::DownstreamEnvelope) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(envelope).unwrap_or_default();
        topic.publish(&envelope.target_user_id.to_string(), Bytes::from(bytes)).await
    }

    async fn dead_letter(&self, envelope: &UpstreamEnvelope, reason: &str) {
        record_stage("dead_letter", "sent");
        error!(reason, client_msg_id = %envelope.client_msg_id, "routing envelope to dead letter topic");
        let payload = serde_json::json!({
            "envelope": envelope,
            "reason": reason,
        });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            let _ = self.dead_letter.publish(&envelope.conversation_id, Bytes::from(bytes)).await;
        }
    }
}

fn group_id_of(conversation_id: &ConversationId) -> msgcore_common::GroupId {
    msgcore_common::GroupId(conversation_id.as_str().trim_start_matches("group_").parse().unwrap_or(0))
}

fn kind_label(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Single => "single",
        ConversationKind::Group => "group",
        ConversationKind::World => "world",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use msgcore_bus::{InProcessTopic, Topic};
    use msgcore_common::GroupId;
    use msgcore_dedup::InProcessDedup;
    use msgcore_idgen::IdGenerator;
    use msgcore_repo::InMemoryRepo;
    use msgcore_seqalloc::InMemorySeqAllocator;

    use super::*;
    use crate::config::LogicConfig;

    fn make_worker(repo: Arc<InMemoryRepo>) -> (LogicWorker, Arc<InProcessTopic>, Arc<InProcessTopic>) {
        let upstream = InProcessTopic::new("upstream-test", 1, 64);
        let consumer = upstream.take_partition(0).unwrap();
        let task_topic = InProcessTopic::new("task-test", 1, 64);
        let dead_letter = InProcessTopic::new("dead-letter-test", 1, 64);
        let worker = LogicWorker::new(
            consumer,
            repo,
            Arc::new(InProcessDedup::new()),
            Arc::new(InMemorySeqAllocator::new()),
            Arc::new(IdGenerator::new(1).unwrap()),
            Arc::new(DownstreamTopics::new(4)),
            Arc::clone(&task_topic),
            Arc::clone(&dead_letter),
            LogicConfig::default(),
        );
        (worker, task_topic, dead_letter)
    }

    fn envelope(conversation_id: &str, sender: UserId, client_msg_id: &str) -> UpstreamEnvelope {
        UpstreamEnvelope {
            sender_user_id: sender,
            conversation_id: conversation_id.to_string(),
            content: "hi".to_string(),
            message_type: "text".to_string(),
            client_msg_id: client_msg_id.to_string(),
            trace_id: "trace-1".to_string(),
            received_at: 1,
            peer_user_id: None,
        }
    }

    #[tokio::test]
    async fn single_conversation_persists_and_assigns_seq() {
        let repo = Arc::new(InMemoryRepo::new());
        let conv = ConversationId::single(UserId(1), UserId(2));
        repo.seed_participants(&conv, &[UserId(1), UserId(2)]);
        let (worker, _task, _dl) = make_worker(Arc::clone(&repo));

        worker
            .process_envelope(envelope(conv.as_str(), UserId(1), "cm-1"))
            .await
            .unwrap();

        let messages = repo.get_messages(&conv, 1, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].seq_id, 1);
    }

    #[tokio::test]
    async fn duplicate_client_msg_id_is_a_no_op() {
        let repo = Arc::new(InMemoryRepo::new());
        let conv = ConversationId::single(UserId(1), UserId(2));
        repo.seed_participants(&conv, &[UserId(1), UserId(2)]);
        let (worker, _task, _dl) = make_worker(Arc::clone(&repo));

        worker.process_envelope(envelope(conv.as_str(), UserId(1), "cm-1")).await.unwrap();
        worker.process_envelope(envelope(conv.as_str(), UserId(1), "cm-1")).await.unwrap();

        assert_eq!(repo.get_messages(&conv, 1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_group_routes_through_task_topic_not_direct_fanout() {
        let repo = Arc::new(InMemoryRepo::new());
        let members: Vec<UserId> = (1..=600).map(UserId).collect();
        repo.seed_group(GroupId(7), &members);
        let conv = ConversationId::group(GroupId(7));
        let (worker, task_topic, _dl) = make_worker(Arc::clone(&repo));
        let mut task_consumer = task_topic.take_partition(msgcore_bus::partition_for(conv.as_str(), 1)).unwrap();

        worker.process_envelope(envelope(conv.as_str(), UserId(1), "cm-1")).await.unwrap();

        let (_key, payload) = tokio::time::timeout(Duration::from_millis(100), task_consumer.recv())
            .await
            .expect("task envelope published")
            .expect("channel open");
        let task_envelope: TaskEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(task_envelope.conversation_id, conv);
    }

    #[tokio::test]
    async fn world_conversation_always_routes_through_task() {
        let repo = Arc::new(InMemoryRepo::new());
        let conv = ConversationId::world();
        let (worker, task_topic, _dl) = make_worker(Arc::clone(&repo));
        let mut task_consumer = task_topic.take_partition(msgcore_bus::partition_for(conv.as_str(), 1)).unwrap();

        worker.process_envelope(envelope(conv.as_str(), UserId(1), "cm-1")).await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), task_consumer.recv())
            .await
            .expect("task envelope published")
            .expect("channel open");
    }

    #[tokio::test]
    async fn small_group_direct_fans_out_to_connected_sessions() {
        let repo = Arc::new(InMemoryRepo::new());
        let members = [UserId(1), UserId(2), UserId(3)];
        repo.seed_group(GroupId(1), &members);
        repo.set_session_pointer(UserId(2), "gw-a", Duration::from_secs(90)).await;
        let conv = ConversationId::group(GroupId(1));
        let (worker, _task, _dl) = make_worker(Arc::clone(&repo));

        worker.process_envelope(envelope(conv.as_str(), UserId(1), "cm-1")).await.unwrap();

        let messages = repo.get_messages(&conv, 1, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
    }
}
