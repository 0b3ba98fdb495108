//! Pure in-memory `Repo` double — no sqlite — so `msgcore-logic` and
//! `msgcore-task` unit tests never touch a database.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use msgcore_common::{ConversationId, ConversationKind, GroupId, UserId};
use msgcore_hotcache::HotCache;
use msgcore_protocol::{MAX_GET_MESSAGES_LIMIT, envelopes::MessageRecord};
use msgcore_sessions::{InProcessSessionRegistry, SessionPointer, SessionRegistry};

use crate::{ConversationSummary, PeerSummary, Repo, RepoError};

struct ConversationMeta {
    last_seq: u64,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
    meta: HashMap<ConversationId, ConversationMeta>,
    participants: HashMap<ConversationId, Vec<UserId>>,
    groups: HashMap<GroupId, Vec<UserId>>,
    all_users: Vec<UserId>,
}

pub struct InMemoryRepo {
    inner: Mutex<Inner>,
    hot_cache: Arc<HotCache>,
    sessions: Arc<dyn SessionRegistry>,
}

impl Default for InMemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            hot_cache: Arc::new(HotCache::default()),
            sessions: Arc::new(InProcessSessionRegistry::default()),
        }
    }

    /// Test helper: register a group and its members directly.
    pub fn seed_group(&self, group_id: GroupId, members: &[UserId]) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.groups.insert(group_id, members.to_vec());
        let conversation_id = ConversationId::group(group_id);
        inner.participants.insert(conversation_id, members.to_vec());
    }

    /// Test helper: register single/world conversation participants.
    pub fn seed_participants(&self, conversation_id: &ConversationId, participants: &[UserId]) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .participants
            .insert(conversation_id.clone(), participants.to_vec());
    }

    /// Test helper: register users for `world` conversation paging.
    pub fn seed_users(&self, users: &[UserId]) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        for u in users {
            if !inner.all_users.contains(u) {
                inner.all_users.push(*u);
            }
        }
    }
}

#[async_trait]
impl Repo for InMemoryRepo {
    async fn save_message(&self, msg: MessageRecord, recipients: &[UserId]) -> Result<(), RepoError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let bucket = inner.messages.entry(msg.conversation_id.clone()).or_default();
        if bucket.iter().any(|m| m.seq_id == msg.seq_id) {
            return Ok(());
        }
        bucket.push(msg.clone());

        let meta = inner.meta.entry(msg.conversation_id.clone()).or_insert(ConversationMeta { last_seq: 0 });
        meta.last_seq = meta.last_seq.max(msg.seq_id);
        drop(inner);

        let record = Arc::new(msg.clone());
        self.hot_cache.push_message(Arc::clone(&record));
        for recipient in recipients {
            if *recipient == msg.sender_id {
                continue;
            }
            self.hot_cache.increment_unread(&msg.conversation_id, *recipient);
        }
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &ConversationId, from_seq: u64, limit: usize) -> Result<Vec<MessageRecord>, RepoError> {
        let limit = limit.min(MAX_GET_MESSAGES_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner
            .messages
            .get(conversation_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.seq_id >= from_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_conversation_list(&self, user: UserId) -> Result<Vec<ConversationSummary>, RepoError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut summaries: Vec<ConversationSummary> = inner
            .participants
            .iter()
            .filter(|(_, members)| members.contains(&user))
            .map(|(conversation_id, members)| {
                let last_message = inner.messages.get(conversation_id).and_then(|m| m.last());
                let unread_count = self.hot_cache.get_unread(conversation_id, user);
                let peer_summary = match ConversationKind::of(conversation_id) {
                    ConversationKind::World => PeerSummary::World,
                    ConversationKind::Group => {
                        let group_id = GroupId(conversation_id.as_str().trim_start_matches("group_").parse().unwrap_or(0));
                        PeerSummary::Group {
                            group_id,
                            member_count: members.len() as u64,
                        }
                    },
                    ConversationKind::Single => {
                        let peer = members.iter().copied().find(|u| *u != user).unwrap_or(user);
                        PeerSummary::Single { peer }
                    },
                };
                ConversationSummary {
                    conversation_id: conversation_id.clone(),
                    last_message: last_message.cloned(),
                    unread_count,
                    peer_summary,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            let a_ts = a.last_message.as_ref().map(|m| m.created_at).unwrap_or(0);
            let b_ts = b.last_message.as_ref().map(|m| m.created_at).unwrap_or(0);
            b_ts.cmp(&a_ts)
        });
        Ok(summaries)
    }

    async fn mark_as_read(&self, conversation_id: &ConversationId, user: UserId, up_to_seq: u64) -> Result<(), RepoError> {
        let last_seq = self
            .inner
            .lock()
            .expect("lock poisoned")
            .meta
            .get(conversation_id)
            .map(|m| m.last_seq)
            .unwrap_or(0);
        self.hot_cache.mark_read(conversation_id, user, last_seq, up_to_seq);
        Ok(())
    }

    async fn get_session_pointer(&self, user: UserId) -> Option<SessionPointer> {
        self.sessions.get(user).await.ok().flatten()
    }

    async fn set_session_pointer(&self, user: UserId, instance_id: &str, ttl: Duration) {
        let _ = self.sessions.set(user, instance_id, ttl).await;
    }

    async fn refresh_session_pointer(&self, user: UserId, ttl: Duration) {
        let _ = self.sessions.refresh(user, ttl).await;
    }

    async fn clear_session_pointer(&self, user: UserId, expected_instance_id: &str) -> bool {
        self.sessions.clear_if(user, expected_instance_id).await.unwrap_or(false)
    }

    async fn get_session_pointers(&self, users: &[UserId]) -> HashMap<UserId, SessionPointer> {
        self.sessions.get_many(users).await.unwrap_or_default()
    }

    async fn get_group_member_count(&self, group_id: &GroupId) -> Result<u64, RepoError> {
        Ok(self
            .inner
            .lock()
            .expect("lock poisoned")
            .groups
            .get(group_id)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    async fn get_group_members_page(&self, group_id: &GroupId, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let Some(members) = inner.groups.get(group_id) else {
            return Ok(Vec::new());
        };
        let mut sorted = members.clone();
        sorted.sort();
        let after = after_user_id.unwrap_or(UserId(0));
        Ok(sorted.into_iter().filter(|u| *u > after || after_user_id.is_none() && *u >= UserId(0)).take(limit).collect())
    }

    async fn get_all_users_page(&self, after_user_id: Option<UserId>, limit: usize) -> Result<Vec<UserId>, RepoError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut sorted = inner.all_users.clone();
        sorted.sort();
        let after = after_user_id.unwrap_or(UserId(0));
        Ok(sorted
            .into_iter()
            .filter(|u| *u > after || after_user_id.is_none())
            .take(limit)
            .collect())
    }

    async fn get_conversation_participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, RepoError> {
        Ok(self
            .inner
            .lock()
            .expect("lock poisoned")
            .participants
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ensure_conversation_participants(&self, conversation_id: &ConversationId, participants: &[UserId]) -> Result<(), RepoError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let entry = inner.participants.entry(conversation_id.clone()).or_default();
        for p in participants {
            if !entry.contains(p) {
                entry.push(*p);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(conv: &ConversationId, seq: u64, sender: UserId) -> MessageRecord {
        MessageRecord {
            message_id: msgcore_common::MessageId(seq),
            conversation_id: conv.clone(),
            sender_id: sender,
            seq_id: seq,
            client_msg_id: format!("cm-{seq}"),
            message_type: "text".into(),
            content: "hi".into(),
            created_at: seq as i64,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let repo = InMemoryRepo::new();
        let conv = ConversationId::single(UserId(100), UserId(200));
        repo.save_message(msg(&conv, 1, UserId(100)), &[UserId(200)]).await.unwrap();

        let fetched = repo.get_messages(&conv, 1, 1).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].seq_id, 1);
    }

    #[tokio::test]
    async fn duplicate_seq_is_idempotent() {
        let repo = InMemoryRepo::new();
        let conv = ConversationId::world();
        repo.save_message(msg(&conv, 1, UserId(1)), &[]).await.unwrap();
        repo.save_message(msg(&conv, 1, UserId(1)), &[]).await.unwrap();
        assert_eq!(repo.get_messages(&conv, 1, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_as_read_resets_unread_to_remaining() {
        let repo = InMemoryRepo::new();
        let conv = ConversationId::single(UserId(100), UserId(200));
        repo.seed_participants(&conv, &[UserId(100), UserId(200)]);
        repo.save_message(msg(&conv, 1, UserId(100)), &[UserId(200)]).await.unwrap();
        repo.save_message(msg(&conv, 2, UserId(100)), &[UserId(200)]).await.unwrap();

        let list = repo.get_conversation_list(UserId(200)).await.unwrap();
        assert_eq!(list[0].unread_count, 2);

        repo.mark_as_read(&conv, UserId(200), 1).await.unwrap();
        let list = repo.get_conversation_list(UserId(200)).await.unwrap();
        assert_eq!(list[0].unread_count, 1);
    }

    #[tokio::test]
    async fn group_member_paging_matches_threshold_boundary() {
        let repo = InMemoryRepo::new();
        let members: Vec<UserId> = (1..=500).map(UserId).collect();
        repo.seed_group(GroupId(7), &members);
        assert_eq!(repo.get_group_member_count(&GroupId(7)).await.unwrap(), 500);
        let page = repo.get_group_members_page(&GroupId(7), None, 500).await.unwrap();
        assert_eq!(page.len(), 500);
    }
}
