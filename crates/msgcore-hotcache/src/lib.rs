//! HotCache: recent-messages ring + unread counters, spec §3/§4.4.
//!
//! Spec treats HotCache as an external, reconstructable-from-Store cache
//! tier. This crate ships the in-process approximation moltis-gateway's own state layer would
//! reach for at this scale — grounded on `moltis-gateway::state`'s
//! bounded/evicting `DashMap`-backed registries (the `DedupeCache` shape
//! reused by `msgcore-dedup`) and `moltis-gateway::nodes::NodeRegistry`'s
//! dual-index map pattern, applied here to the conversation→window and
//! (conversation,user)→counter maps. A real deployment swaps this crate for
//! a client to an external cache (Redis/Memcached) behind the same trait
//! boundary used by `msgcore-repo`.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use msgcore_common::{ConversationId, UserId};
use msgcore_protocol::{HOT_WINDOW_SIZE, envelopes::MessageRecord};

/// How much of a requested range a [`HotWindow`] read actually covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// The full `[from_seq, from_seq + limit)` range (subject to `last_seq`)
    /// was served from the window.
    Full(Vec<Arc<MessageRecord>>),
    /// Only a suffix was covered; `first_covered_seq` is where Store must
    /// pick up (inclusive) to fill the gap below it.
    Partial {
        covered: Vec<Arc<MessageRecord>>,
        first_covered_seq: u64,
    },
    /// Nothing in range was resident (spec invariant 5: "or empty after
    /// eviction").
    Empty,
}

/// Per-conversation bounded recent-message window, spec §3 HotWindow.
/// Keyed by `seq_id`; trimmed to the most recent `capacity` entries on
/// every insert so it remains a contiguous suffix of the persisted log.
struct Window {
    capacity: usize,
    messages: BTreeMap<u64, Arc<MessageRecord>>,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: BTreeMap::new(),
        }
    }

    fn push(&mut self, msg: Arc<MessageRecord>) {
        self.messages.insert(msg.seq_id, msg);
        while self.messages.len() > self.capacity {
            let oldest = *self.messages.keys().next().expect("non-empty after push");
            self.messages.remove(&oldest);
        }
    }

    fn range(&self, from_seq: u64, limit: usize) -> Coverage {
        if self.messages.is_empty() || limit == 0 {
            return Coverage::Empty;
        }
        let oldest = *self.messages.keys().next().expect("checked non-empty");
        let collected: Vec<Arc<MessageRecord>> = self
            .messages
            .range(from_seq..)
            .take(limit)
            .map(|(_, v)| Arc::clone(v))
            .collect();
        if collected.is_empty() {
            return Coverage::Empty;
        }
        if from_seq >= oldest {
            Coverage::Full(collected)
        } else {
            Coverage::Partial {
                covered: collected,
                first_covered_seq: oldest,
            }
        }
    }

    fn top(&self) -> Option<Arc<MessageRecord>> {
        self.messages.values().next_back().cloned()
    }
}

/// `HotWindow` + `UnreadCounter` combined cache, spec §3/§4.4.
pub struct HotCache {
    windows: DashMap<ConversationId, Window>,
    unread: DashMap<(ConversationId, UserId), u64>,
    window_capacity: usize,
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new(HOT_WINDOW_SIZE)
    }
}

impl HotCache {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            unread: DashMap::new(),
            window_capacity,
        }
    }

    /// Append a freshly persisted message, spec §4.4 SaveMessage step 2.
    pub fn push_message(&self, msg: Arc<MessageRecord>) {
        self.windows
            .entry(msg.conversation_id.clone())
            .or_insert_with(|| Window::new(self.window_capacity))
            .push(msg);
    }

    pub fn range(&self, conversation_id: &ConversationId, from_seq: u64, limit: usize) -> Coverage {
        match self.windows.get(conversation_id) {
            Some(window) => window.range(from_seq, limit),
            None => Coverage::Empty,
        }
    }

    pub fn top(&self, conversation_id: &ConversationId) -> Option<Arc<MessageRecord>> {
        self.windows.get(conversation_id).and_then(|w| w.top())
    }

    /// Spec §4.4 SaveMessage step 3: increment for every recipient except
    /// the sender.
    pub fn increment_unread(&self, conversation_id: &ConversationId, user: UserId) {
        *self
            .unread
            .entry((conversation_id.clone(), user))
            .or_insert(0) += 1;
    }

    pub fn get_unread(&self, conversation_id: &ConversationId, user: UserId) -> u64 {
        self.unread
            .get(&(conversation_id.clone(), user))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Spec §4.4 MarkAsRead: `max(0, last_seq - up_to_seq)`, idempotent.
    pub fn mark_read(&self, conversation_id: &ConversationId, user: UserId, last_seq: u64, up_to_seq: u64) {
        let remaining = last_seq.saturating_sub(up_to_seq);
        self.unread.insert((conversation_id.clone(), user), remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(conv: &ConversationId, seq: u64) -> Arc<MessageRecord> {
        Arc::new(MessageRecord {
            message_id: msgcore_common::MessageId(seq),
            conversation_id: conv.clone(),
            sender_id: UserId(1),
            seq_id: seq,
            client_msg_id: format!("cm-{seq}"),
            message_type: "text".into(),
            content: "hi".into(),
            created_at: 0,
        })
    }

    #[test]
    fn window_trims_to_capacity_keeping_contiguous_suffix() {
        let cache = HotCache::new(3);
        let conv = ConversationId::world();
        for seq in 1..=5 {
            cache.push_message(msg(&conv, seq));
        }
        match cache.range(&conv, 1, 100) {
            Coverage::Partial {
                covered,
                first_covered_seq,
            } => {
                assert_eq!(first_covered_seq, 3);
                assert_eq!(covered.iter().map(|m| m.seq_id).collect::<Vec<_>>(), vec![3, 4, 5]);
            },
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[test]
    fn range_fully_covered_when_from_seq_within_window() {
        let cache = HotCache::new(10);
        let conv = ConversationId::world();
        for seq in 1..=5 {
            cache.push_message(msg(&conv, seq));
        }
        match cache.range(&conv, 3, 10) {
            Coverage::Full(msgs) => assert_eq!(msgs.iter().map(|m| m.seq_id).collect::<Vec<_>>(), vec![3, 4, 5]),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn empty_window_reports_empty_coverage() {
        let cache = HotCache::new(10);
        assert_eq!(cache.range(&ConversationId::world(), 1, 10), Coverage::Empty);
    }

    #[test]
    fn unread_increments_and_mark_read_resets_to_remaining() {
        let cache = HotCache::new(10);
        let conv = ConversationId::world();
        let user = UserId(200);
        cache.increment_unread(&conv, user);
        cache.increment_unread(&conv, user);
        assert_eq!(cache.get_unread(&conv, user), 2);

        cache.mark_read(&conv, user, 5, 3);
        assert_eq!(cache.get_unread(&conv, user), 2);

        cache.mark_read(&conv, user, 5, 5);
        assert_eq!(cache.get_unread(&conv, user), 0);
    }
}
