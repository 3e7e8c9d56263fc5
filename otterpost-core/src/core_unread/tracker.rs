//! Unread Tracker
//!
//! Per-conversation read position and derived unread counts. A message is
//! unread iff it was sent by someone else after the conversation's
//! `last_read_at_ns`. Each qualifying message id is counted once, however
//! many times the stream or a reload delivers it.
//!
//! Persisted entries, keyed per owner address:
//!
//! ```text
//! unread:last_read:{address}:{conversation_id} = <ns>
//! unread:count:{address}:{conversation_id}     = <count>
//! ```

use super::storage::KeyValueStore;
use crate::metrics;
use crate::model::{Address, ConversationId, InboxId, Message, MessageId, MessagePreview};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone)]
struct UnreadEntry {
    last_read_ns: u64,
    count: u32,
    counted: HashSet<MessageId>,
}

pub struct UnreadTracker {
    owner: Address,
    self_inbox_id: InboxId,
    store: Arc<dyn KeyValueStore>,
    entries: HashMap<ConversationId, UnreadEntry>,
}

impl UnreadTracker {
    pub fn new(owner: Address, self_inbox_id: InboxId, store: Arc<dyn KeyValueStore>) -> Self {
        Self { owner, self_inbox_id, store, entries: HashMap::new() }
    }

    fn last_read_key(&self, id: &ConversationId) -> String {
        format!("unread:last_read:{}:{}", self.owner, id)
    }

    fn count_key(&self, id: &ConversationId) -> String {
        format!("unread:count:{}:{}", self.owner, id)
    }

    fn read_u64(&self, key: &str) -> u64 {
        match self.store.get(key) {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, "Ignoring malformed unread entry");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!(key, error = %e, "Failed to read unread entry");
                0
            }
        }
    }

    fn write(&self, key: &str, value: u64) {
        if let Err(e) = self.store.set(key, &value.to_string()) {
            warn!(key, error = %e, "Failed to persist unread entry");
        }
    }

    fn entry(&mut self, id: &ConversationId) -> &mut UnreadEntry {
        if !self.entries.contains_key(id) {
            let loaded = UnreadEntry {
                last_read_ns: self.read_u64(&self.last_read_key(id)),
                count: self.read_u64(&self.count_key(id)).min(u32::MAX as u64) as u32,
                counted: HashSet::new(),
            };
            self.entries.insert(id.clone(), loaded);
        }
        self.entries.entry(id.clone()).or_default()
    }

    pub fn last_read(&mut self, id: &ConversationId) -> u64 {
        self.entry(id).last_read_ns
    }

    pub fn count(&mut self, id: &ConversationId) -> u32 {
        self.entry(id).count
    }

    /// Sum of counts over the given conversations
    pub fn total<'a>(&mut self, ids: impl IntoIterator<Item = &'a ConversationId>) -> u32 {
        ids.into_iter().map(|id| self.count(id)).sum()
    }

    fn unread_at(&mut self, id: &ConversationId, sender: &InboxId, sent_at_ns: u64) -> bool {
        *sender != self.self_inbox_id && sent_at_ns > self.last_read(id)
    }

    pub fn is_unread(&mut self, message: &Message) -> bool {
        self.unread_at(&message.conversation_id, &message.sender_inbox_id, message.sent_at_ns)
    }

    /// Count an inbound message; true if the count changed
    pub fn record_inbound(&mut self, message: &Message) -> bool {
        if !self.is_unread(message) {
            return false;
        }
        let entry = self.entry(&message.conversation_id);
        if !entry.counted.insert(message.id.clone()) {
            return false;
        }
        entry.count = entry.count.saturating_add(1);
        let count = entry.count as u64;
        self.write(&self.count_key(&message.conversation_id), count);
        metrics::increment(metrics::UNREAD_INCREMENTS);
        true
    }

    /// Reconcile the persisted count with the latest message seen at load
    ///
    /// Only the latest message is visible here, so this is an approximation:
    /// a zero count with an unread latest message becomes one, and a non-zero
    /// count is kept as is even when more arrived while the app was closed.
    /// [`recount`](Self::recount) corrects it once the history is read.
    pub fn seed_latest(&mut self, id: &ConversationId, latest: &MessagePreview) -> bool {
        if !self.unread_at(id, &latest.sender_inbox_id, latest.sent_at_ns) {
            return false;
        }
        let entry = self.entry(id);
        if entry.count > 0 || !entry.counted.insert(latest.message_id.clone()) {
            return false;
        }
        entry.count = 1;
        self.write(&self.count_key(id), 1);
        true
    }

    /// Recount from a conversation's full history; true if the count changed
    ///
    /// Messages already counted from the stream stay counted even if the
    /// history snapshot predates them.
    pub fn recount(&mut self, id: &ConversationId, history: &[Message]) -> bool {
        let unread: Vec<MessageId> = history
            .iter()
            .filter(|m| &m.conversation_id == id && self.is_unread(m))
            .map(|m| m.id.clone())
            .collect();
        let entry = self.entry(id);
        entry.counted.extend(unread);
        let count = entry.counted.len().min(u32::MAX as usize) as u32;
        if entry.count == count {
            return false;
        }
        debug!(conversation_id = %id, from = entry.count, to = count, "Unread recounted");
        entry.count = count;
        self.write(&self.count_key(id), count as u64);
        true
    }

    /// Zero the count and move the read position to `now_ns`
    ///
    /// The read position never moves backwards.
    pub fn mark_as_read(&mut self, id: &ConversationId, now_ns: u64) -> u64 {
        let entry = self.entry(id);
        entry.last_read_ns = entry.last_read_ns.max(now_ns);
        entry.count = 0;
        entry.counted.clear();
        let last_read = entry.last_read_ns;

        self.write(&self.last_read_key(id), last_read);
        self.write(&self.count_key(id), 0);
        debug!(conversation_id = %id, last_read, "Marked as read");
        last_read
    }

    /// Forget in-memory state (persisted entries stay)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_messages::preview_of;
    use crate::core_unread::storage::MemoryKvStore;
    use proptest::prelude::*;

    fn owner() -> Address {
        Address::from_network(format!("0x{:040x}", 1))
    }

    fn tracker(store: Arc<dyn KeyValueStore>) -> UnreadTracker {
        UnreadTracker::new(owner(), InboxId::new("me"), store)
    }

    fn msg(id: &str, sender: &str, at: u64) -> Message {
        Message::text(MessageId::new(id), ConversationId::new("c1"), InboxId::new(sender), at, "x")
    }

    #[test]
    fn test_counts_each_inbound_message_once() {
        let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
        assert!(tracker.record_inbound(&msg("m1", "peer", 10)));
        assert!(!tracker.record_inbound(&msg("m1", "peer", 10)));
        assert!(!tracker.record_inbound(&msg("m2", "me", 11)));
        assert_eq!(tracker.count(&ConversationId::new("c1")), 1);
    }

    #[test]
    fn test_mark_as_read_zeroes_and_blocks_older_messages() {
        let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
        let c1 = ConversationId::new("c1");
        tracker.record_inbound(&msg("m1", "peer", 10));
        tracker.record_inbound(&msg("m2", "peer", 20));

        tracker.mark_as_read(&c1, 25);
        assert_eq!(tracker.count(&c1), 0);
        assert!(!tracker.record_inbound(&msg("m2", "peer", 20)));
        assert!(tracker.record_inbound(&msg("m3", "peer", 30)));

        // clock going backwards does not rewind the read position
        assert_eq!(tracker.mark_as_read(&c1, 5), 25);
    }

    #[test]
    fn test_state_persists_per_owner() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let c1 = ConversationId::new("c1");
        {
            let mut first = tracker(store.clone());
            first.mark_as_read(&c1, 100);
            first.record_inbound(&msg("m1", "peer", 150));
        }

        let mut reopened = tracker(store.clone());
        assert_eq!(reopened.last_read(&c1), 100);
        assert_eq!(reopened.count(&c1), 1);

        let other = Address::from_network(format!("0x{:040x}", 2));
        let mut stranger = UnreadTracker::new(other, InboxId::new("me"), store);
        assert_eq!(stranger.last_read(&c1), 0);
    }

    #[test]
    fn test_seed_latest() {
        let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
        let c1 = ConversationId::new("c1");
        let latest = preview_of(&msg("m1", "peer", 10));
        assert!(tracker.seed_latest(&c1, &latest));
        assert!(!tracker.seed_latest(&c1, &latest));
        assert!(!tracker.seed_latest(&c1, &preview_of(&msg("m0", "me", 12))));
        // the stream replaying the same message does not double count
        assert!(!tracker.record_inbound(&msg("m1", "peer", 10)));
        assert_eq!(tracker.count(&c1), 1);
    }

    #[test]
    fn test_seed_latest_keeps_live_count_accurate() {
        let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
        let c1 = ConversationId::new("c1");
        assert!(tracker.record_inbound(&msg("m1", "peer", 10)));
        // a preview that already shows the next message must not swallow it
        assert!(!tracker.seed_latest(&c1, &preview_of(&msg("m2", "peer", 20))));
        assert!(tracker.record_inbound(&msg("m2", "peer", 20)));
        assert_eq!(tracker.count(&c1), 2);
    }

    #[test]
    fn test_recount_from_history_corrects_persisted_count() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let c1 = ConversationId::new("c1");
        {
            let mut before = tracker(store.clone());
            before.mark_as_read(&c1, 5);
            before.record_inbound(&msg("m1", "peer", 10));
        }

        // three more arrived while closed; the preview alone cannot tell
        let mut tracker = tracker(store);
        let history = vec![
            msg("m0", "peer", 4),
            msg("m1", "peer", 10),
            msg("m2", "peer", 20),
            msg("m3", "me", 30),
            msg("m4", "peer", 40),
        ];
        assert!(!tracker.seed_latest(&c1, &preview_of(&history[4])));
        assert_eq!(tracker.count(&c1), 1);

        assert!(tracker.recount(&c1, &history));
        assert_eq!(tracker.count(&c1), 3);
        assert!(!tracker.recount(&c1, &history));
        assert!(!tracker.record_inbound(&history[4]));

        // a streamed message newer than the snapshot survives the next recount
        assert!(tracker.record_inbound(&msg("m5", "peer", 50)));
        assert!(!tracker.recount(&c1, &history));
        assert_eq!(tracker.count(&c1), 4);
    }

    #[test]
    fn test_total_sums_requested_conversations() {
        let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
        tracker.record_inbound(&msg("m1", "peer", 10));
        let mut other = msg("m2", "peer", 10);
        other.conversation_id = ConversationId::new("c2");
        tracker.record_inbound(&other);

        let ids = [ConversationId::new("c1"), ConversationId::new("c2")];
        assert_eq!(tracker.total(ids.iter()), 2);
        assert_eq!(tracker.total(ids[..1].iter()), 1);
    }

    proptest! {
        #[test]
        fn prop_nothing_at_or_before_read_position_is_counted(
            times in proptest::collection::vec(0u64..100, 1..30),
            read_at in 0u64..100,
        ) {
            let mut tracker = tracker(Arc::new(MemoryKvStore::new()));
            let c1 = ConversationId::new("c1");
            let messages: Vec<Message> = times
                .iter()
                .enumerate()
                .map(|(i, t)| msg(&format!("m{}", i), "peer", *t))
                .collect();
            for m in &messages {
                tracker.record_inbound(m);
            }
            tracker.mark_as_read(&c1, read_at);
            prop_assert_eq!(tracker.count(&c1), 0);

            // reprocess everything
            for m in &messages {
                tracker.record_inbound(m);
            }
            let expected = messages.iter().filter(|m| m.sent_at_ns > read_at).count() as u32;
            prop_assert_eq!(tracker.count(&c1), expected);
        }
    }
}
