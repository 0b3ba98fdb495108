//! TaskWorker: paged fan-out for large groups and the world conversation,
//! spec §4.3.
//!
//! Member pages are fetched sequentially (keyset pagination requires it —
//! each page's cursor is the previous page's last id) but each page's
//! session-resolution-and-publish work runs on a bounded worker pool so
//! slow downstream publishes don't stall the next page fetch.

use std::sync::Arc;

use bytes::Bytes;
use msgcore_bus::{BusError, Consumer, DownstreamTopics, InProcessTopic, PartitionConsumer, Topic};
use msgcore_common::{ConversationId, ConversationKind, GroupId, UserId, retry::retry_with_backoff};
use msgcore_metrics::{record_task_page, record_task_rechunk};
use msgcore_protocol::envelopes::{DownstreamEnvelope, MessageRecord, TaskEnvelope};
use msgcore_repo::Repo;
use msgcore_sessions::registry::{envelopes_for, group_by_instance};
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info_span};

use crate::{config::TaskConfig, error::TaskError};

pub struct TaskWorker {
    consumer: PartitionConsumer,
    repo: Arc<dyn Repo>,
    downstream_topics: Arc<DownstreamTopics>,
    semaphore: Arc<Semaphore>,
    config: TaskConfig,
}

impl TaskWorker {
    pub fn new(consumer: PartitionConsumer, repo: Arc<dyn Repo>, downstream_topics: Arc<DownstreamTopics>, config: TaskConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.worker_pool.max(1)));
        Self {
            consumer,
            repo,
            downstream_topics,
            semaphore,
            config,
        }
    }

    /// Exposed for tests that need to subscribe to a gateway instance's
    /// downstream topic before driving fan-out.
    #[cfg(test)]
    pub fn downstream_topics(&self) -> Arc<DownstreamTopics> {
        Arc::clone(&self.downstream_topics)
    }

    pub async fn run(mut self) {
        while let Some((_key, payload)) = self.consumer.recv().await {
            if let Err(err) = self.handle_payload(payload).await {
                error!(error = %err, "dropping malformed task payload");
            }
        }
    }

    async fn handle_payload(&self, payload: Bytes) -> Result<(), TaskError> {
        let task_envelope: TaskEnvelope = serde_json::from_slice(&payload)?;
        let span = info_span!(
            "task_fan_out",
            trace_id = %task_envelope.trace_id,
            conversation_id = %task_envelope.conversation_id,
        );
        self.process_task_envelope(task_envelope).instrument(span).await;
        Ok(())
    }

    /// Pages through every member of the conversation named by `task_envelope`,
    /// dispatching each page's fan-out to the bounded worker pool. Returns
    /// once every page has been fetched and every dispatched page-worker has
    /// finished (successfully or exhausted) — never re-emits the whole task
    /// on a single page's failure.
    pub async fn process_task_envelope(&self, task_envelope: TaskEnvelope) {
        let conversation_id = task_envelope.conversation_id.clone();
        let kind = ConversationKind::of(&conversation_id);
        let group_id = group_id_of(&conversation_id);

        let mut after: Option<UserId> = None;
        let mut page_handles = Vec::new();

        loop {
            let page = match kind {
                ConversationKind::World => self.repo.get_all_users_page(after, self.config.page_size).await,
                ConversationKind::Group | ConversationKind::Single => self.repo.get_group_members_page(&group_id, after, self.config.page_size).await,
            };
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    error!(error = %err, "failed to fetch member page, stopping fan-out for this task");
                    record_task_page("exhausted");
                    break;
                },
            };
            if page.is_empty() {
                break;
            }
            after = page.last().copied();

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .unwrap_or_else(|_| unreachable!("semaphore is never closed"));
            let repo = Arc::clone(&self.repo);
            let downstream_topics = Arc::clone(&self.downstream_topics);
            let record = task_envelope.message_record.clone();
            let trace_id = task_envelope.trace_id.clone();
            let max_emit = self.config.max_emit_per_publish;
            let retry = self.config.page_retry.clone();

            page_handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = retry_with_backoff(&retry, || fan_out_page(&repo, &downstream_topics, &page, &record, &trace_id, max_emit)).await;
                match result {
                    Ok(()) => record_task_page("ok"),
                    Err(err) => {
                        error!(error = %err, "page fan-out exhausted its retry budget, skipping");
                        record_task_page("exhausted");
                    },
                }
            }));
        }

        for handle in page_handles {
            let _ = handle.await;
        }
    }
}

async fn fan_out_page(
    repo: &Arc<dyn Repo>,
    downstream_topics: &Arc<DownstreamTopics>,
    page: &[UserId],
    record: &MessageRecord,
    trace_id: &str,
    max_emit: usize,
) -> Result<(), TaskError> {
    let targets: Vec<UserId> = page.iter().copied().filter(|u| *u != record.sender_id).collect();
    if targets.is_empty() {
        return Ok(());
    }

    let pointers = repo.get_session_pointers(&targets).await;
    let groups = group_by_instance(&pointers);

    for (instance_id, users) in groups {
        let topic = downstream_topics.get_or_create(&instance_id);
        let chunks: Vec<&[UserId]> = users.chunks(max_emit.max(1)).collect();
        if chunks.len() > 1 {
            record_task_rechunk(chunks.len() as u64);
        }
        for chunk in chunks {
            for downstream in envelopes_for(chunk, record, trace_id) {
                publish_downstream(&topic, &downstream).await?;
            }
        }
    }
    Ok(())
}

async fn publish_downstream(topic: &InProcessTopic, envelope: &DownstreamEnvelope) -> Result<(), BusError> {
    let bytes = serde_json::to_vec(envelope).unwrap_or_default();
    topic.publish(&envelope.target_user_id.to_string(), Bytes::from(bytes)).await
}

fn group_id_of(conversation_id: &ConversationId) -> GroupId {
    GroupId(conversation_id.as_str().trim_start_matches("group_").parse().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use msgcore_bus::{InProcessTopic, Topic, partition_for};
    use msgcore_common::MessageId;
    use msgcore_repo::InMemoryRepo;

    use super::*;

    fn record(conversation_id: &ConversationId, sender: UserId) -> MessageRecord {
        MessageRecord {
            message_id: MessageId(1),
            conversation_id: conversation_id.clone(),
            sender_id: sender,
            seq_id: 1,
            client_msg_id: "cm-1".to_string(),
            message_type: "text".to_string(),
            content: "hi".to_string(),
            created_at: 1,
        }
    }

    fn make_worker(repo: Arc<InMemoryRepo>) -> (TaskWorker, Arc<InProcessTopic>) {
        let task_topic = InProcessTopic::new("task-test", 1, 64);
        let consumer = task_topic.take_partition(0).unwrap();
        let worker = TaskWorker::new(consumer, repo, Arc::new(DownstreamTopics::new(4)), TaskConfig::default());
        (worker, task_topic)
    }

    #[tokio::test]
    async fn pages_through_a_large_group_and_fans_out_to_connected_members() {
        let repo = Arc::new(InMemoryRepo::new());
        let members: Vec<UserId> = (1..=600).map(UserId).collect();
        repo.seed_group(GroupId(7), &members);
        repo.set_session_pointer(UserId(42), "gw-a", Duration::from_secs(90)).await;
        repo.set_session_pointer(UserId(99), "gw-b", Duration::from_secs(90)).await;

        let conv = ConversationId::group(GroupId(7));
        let (worker, _task_topic) = make_worker(Arc::clone(&repo));
        let downstream = worker.downstream_topics();
        let topic_a = downstream.get_or_create("gw-a");
        let topic_b = downstream.get_or_create("gw-b");
        let mut consumer_a = topic_a.take_partition(partition_for("42", 4)).unwrap();
        let mut consumer_b = topic_b.take_partition(partition_for("99", 4)).unwrap();

        let task_envelope = TaskEnvelope {
            message_record: record(&conv, UserId(1)),
            conversation_id: conv.clone(),
            seq_id: 1,
            sender_id: UserId(1),
            trace_id: "trace-1".to_string(),
        };
        worker.process_task_envelope(task_envelope).await;

        let (_k, payload) = tokio::time::timeout(Duration::from_millis(200), consumer_a.recv())
            .await
            .expect("gw-a received a downstream envelope")
            .expect("channel open");
        let envelope: DownstreamEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.target_user_id, UserId(42));

        let (_k, payload) = tokio::time::timeout(Duration::from_millis(200), consumer_b.recv())
            .await
            .expect("gw-b received a downstream envelope")
            .expect("channel open");
        let envelope: DownstreamEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.target_user_id, UserId(99));
    }

    #[tokio::test]
    async fn world_conversation_pages_over_all_registered_users() {
        let repo = Arc::new(InMemoryRepo::new());
        let users: Vec<UserId> = (1..=5).map(UserId).collect();
        repo.seed_users(&users);
        repo.set_session_pointer(UserId(2), "gw-a", Duration::from_secs(90)).await;

        let conv = ConversationId::world();
        let (worker, _task_topic) = make_worker(Arc::clone(&repo));
        let downstream = worker.downstream_topics();
        let topic_a = downstream.get_or_create("gw-a");
        let mut consumer_a = topic_a.take_partition(partition_for("2", 4)).unwrap();

        let task_envelope = TaskEnvelope {
            message_record: record(&conv, UserId(1)),
            conversation_id: conv.clone(),
            seq_id: 1,
            sender_id: UserId(1),
            trace_id: "trace-1".to_string(),
        };
        worker.process_task_envelope(task_envelope).await;

        let (_k, payload) = tokio::time::timeout(Duration::from_millis(200), consumer_a.recv())
            .await
            .expect("world fan-out reached the connected member")
            .expect("channel open");
        let envelope: DownstreamEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.target_user_id, UserId(2));
    }

    #[tokio::test]
    async fn empty_group_is_a_no_op() {
        let repo = Arc::new(InMemoryRepo::new());
        let conv = ConversationId::group(GroupId(99));
        let (worker, _task_topic) = make_worker(Arc::clone(&repo));

        let task_envelope = TaskEnvelope {
            message_record: record(&conv, UserId(1)),
            conversation_id: conv.clone(),
            seq_id: 1,
            sender_id: UserId(1),
            trace_id: "trace-1".to_string(),
        };
        worker.process_task_envelope(task_envelope).await;
    }
}
