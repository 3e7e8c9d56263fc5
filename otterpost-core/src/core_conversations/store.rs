//! Conversation Store
//!
//! One insertion-ordered map of conversation previews. Consent views
//! (Allowed / Unknown / Denied) are filters over the same map, sorted by
//! activity descending with a stable tie order.
//!
//! Merge rules:
//! - streamed conversation: existing id is replaced in place, a new id is
//!   prepended
//! - initial load: entries already present keep whichever preview is newer
//! - new message: preview changes only if the message is strictly newer

use crate::core_messages::preview_of;
use crate::model::{Address, ConsentState, Conversation, ConversationId, ConversationKind, InboxId, Message};
use hashlink::LinkedHashMap;
use tracing::trace;

/// Result of a streamed upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    entries: LinkedHashMap<ConversationId, Conversation>,
}

/// Keep the newer of two previews, and the existing unread count
fn carry_over(existing: &Conversation, incoming: &mut Conversation) {
    let existing_newer = match (&existing.last_message, &incoming.last_message) {
        (Some(old), Some(new)) => old.sent_at_ns > new.sent_at_ns,
        (Some(_), None) => true,
        _ => false,
    };
    if existing_newer {
        incoming.last_message = existing.last_message.clone();
    }
    incoming.unread_count = existing.unread_count;
    if incoming.peer_address().is_none() {
        if let (
            ConversationKind::Dm { peer_address: slot, .. },
            Some(address),
        ) = (&mut incoming.kind, existing.peer_address())
        {
            *slot = Some(address.clone());
        }
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.entries.get(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Merge the initial batch load
    pub fn apply_loaded(&mut self, conversations: Vec<Conversation>) {
        for mut conversation in conversations {
            match self.entries.get(&conversation.id) {
                Some(existing) => {
                    carry_over(existing, &mut conversation);
                    self.entries.replace(conversation.id.clone(), conversation);
                }
                None => {
                    self.entries.insert(conversation.id.clone(), conversation);
                }
            }
        }
    }

    /// Merge a conversation from the live stream (or a local create)
    pub fn upsert(&mut self, mut conversation: Conversation) -> Upsert {
        let id = conversation.id.clone();
        match self.entries.get(&id) {
            Some(existing) => {
                carry_over(existing, &mut conversation);
                self.entries.replace(id, conversation);
                Upsert::Replaced
            }
            None => {
                self.entries.insert(id.clone(), conversation);
                self.entries.to_front(&id);
                Upsert::Inserted
            }
        }
    }

    /// Update a preview from a new message; false if unknown or not newer
    pub fn apply_message(&mut self, message: &Message) -> bool {
        let Some(conversation) = self.entries.get_mut(&message.conversation_id) else {
            return false;
        };
        let newer = conversation
            .last_message
            .as_ref()
            .map_or(true, |p| message.sent_at_ns > p.sent_at_ns);
        if newer {
            conversation.last_message = Some(preview_of(message));
        } else {
            trace!(conversation_id = %message.conversation_id, "Preview already newer");
        }
        newer
    }

    /// Apply a consent change to every DM with the peer
    pub fn set_consent_for_peer(&mut self, peer: &InboxId, state: ConsentState) -> Vec<ConversationId> {
        let mut changed = Vec::new();
        for (id, conversation) in self.entries.iter_mut() {
            if conversation.peer_inbox_id() == Some(peer) && conversation.consent_state() != state {
                conversation.set_consent_state(state);
                changed.push(id.clone());
            }
        }
        changed
    }

    /// Fill in a resolved peer address on every DM with the peer
    pub fn set_peer_address(&mut self, peer: &InboxId, address: &Address) {
        for conversation in self.entries.values_mut() {
            if let ConversationKind::Dm { peer_inbox_id, peer_address } = &mut conversation.kind {
                if peer_inbox_id == peer {
                    *peer_address = Some(address.clone());
                }
            }
        }
    }

    pub fn set_unread(&mut self, id: &ConversationId, count: u32) {
        if let Some(conversation) = self.entries.get_mut(id) {
            conversation.unread_count = count;
        }
    }

    pub fn find_dm_with(&self, peer: &InboxId) -> Option<&Conversation> {
        self.entries.values().find(|c| c.peer_inbox_id() == Some(peer))
    }

    pub fn find_dm_with_address(&self, address: &Address) -> Option<&Conversation> {
        self.entries.values().find(|c| c.peer_address() == Some(address))
    }

    /// All previews, activity descending, stable on ties
    pub fn sorted(&self) -> Vec<&Conversation> {
        let mut all: Vec<&Conversation> = self.entries.values().collect();
        all.sort_by(|a, b| b.activity_ns().cmp(&a.activity_ns()));
        all
    }

    /// Previews whose consent matches `state`, in display order
    pub fn view(&self, state: ConsentState) -> Vec<Conversation> {
        self.sorted()
            .into_iter()
            .filter(|c| c.consent_state() == state)
            .cloned()
            .collect()
    }

    /// Distinct chain addresses of DM peers, for reputation prefetch
    pub fn peer_addresses(&self) -> Vec<Address> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .values()
            .filter_map(|c| c.peer_address().cloned())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationInfo, MessageId, MessagePreview};
    use proptest::prelude::*;

    fn dm(id: &str, peer: &str, created: u64, consent: ConsentState) -> Conversation {
        Conversation::new(
            ConversationInfo {
                id: ConversationId::new(id),
                kind: ConversationKind::Dm { peer_inbox_id: InboxId::new(peer), peer_address: None },
                created_at_ns: created,
            },
            consent,
            None,
        )
    }

    fn message(conv: &str, id: &str, at: u64) -> Message {
        Message::text(MessageId::new(id), ConversationId::new(conv), InboxId::new("peer"), at, id)
    }

    #[test]
    fn test_streamed_new_id_is_prepended_and_existing_replaced_in_place() {
        let mut store = ConversationStore::new();
        store.apply_loaded(vec![dm("a", "pa", 1, ConsentState::Allowed), dm("b", "pb", 1, ConsentState::Allowed)]);

        assert_eq!(store.upsert(dm("c", "pc", 1, ConsentState::Allowed)), Upsert::Inserted);
        assert_eq!(store.upsert(dm("b", "pb", 1, ConsentState::Allowed)), Upsert::Replaced);

        let order: Vec<_> = store.sorted().iter().map(|c| c.id.as_str().to_string()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_preview_only_moves_forward() {
        let mut store = ConversationStore::new();
        store.upsert(dm("a", "pa", 1, ConsentState::Allowed));

        assert!(store.apply_message(&message("a", "m2", 20)));
        assert!(!store.apply_message(&message("a", "m1", 10)));
        assert!(!store.apply_message(&message("a", "m2", 20)));
        assert_eq!(store.get(&ConversationId::new("a")).unwrap().activity_ns(), 20);

        assert!(!store.apply_message(&message("zzz", "m3", 30)));
    }

    #[test]
    fn test_loaded_preview_does_not_regress_streamed_one() {
        let mut store = ConversationStore::new();
        store.upsert(dm("a", "pa", 1, ConsentState::Allowed));
        store.apply_message(&message("a", "m9", 90));
        store.set_unread(&ConversationId::new("a"), 2);

        let mut loaded = dm("a", "pa", 1, ConsentState::Allowed);
        loaded.last_message = Some(MessagePreview {
            message_id: MessageId::new("m5"),
            sender_inbox_id: InboxId::new("peer"),
            text: "old".to_string(),
            sent_at_ns: 50,
        });
        store.apply_loaded(vec![loaded]);

        let conv = store.get(&ConversationId::new("a")).unwrap();
        assert_eq!(conv.activity_ns(), 90);
        assert_eq!(conv.unread_count, 2);
    }

    #[test]
    fn test_views_filter_one_map() {
        let mut store = ConversationStore::new();
        store.apply_loaded(vec![
            dm("a", "pa", 3, ConsentState::Allowed),
            dm("b", "pb", 2, ConsentState::Unknown),
            dm("c", "pc", 1, ConsentState::Denied),
        ]);
        assert_eq!(store.view(ConsentState::Allowed).len(), 1);
        assert_eq!(store.view(ConsentState::Unknown)[0].id, ConversationId::new("b"));

        let changed = store.set_consent_for_peer(&InboxId::new("pb"), ConsentState::Allowed);
        assert_eq!(changed, vec![ConversationId::new("b")]);
        let allowed: Vec<_> = store.view(ConsentState::Allowed).into_iter().map(|c| c.id).collect();
        assert_eq!(allowed, vec![ConversationId::new("a"), ConversationId::new("b")]);
        assert!(store.view(ConsentState::Unknown).is_empty());
    }

    #[test]
    fn test_peer_address_survives_replacement() {
        let mut store = ConversationStore::new();
        store.upsert(dm("a", "pa", 1, ConsentState::Allowed));
        let address = Address::from_network(format!("0x{:040x}", 7));
        store.set_peer_address(&InboxId::new("pa"), &address);

        store.upsert(dm("a", "pa", 1, ConsentState::Allowed));
        assert_eq!(store.get(&ConversationId::new("a")).unwrap().peer_address(), Some(&address));
        assert_eq!(store.peer_addresses(), vec![address]);
    }

    proptest! {
        #[test]
        fn prop_sorted_is_descending_and_stable(created in proptest::collection::vec(0u64..5, 1..20)) {
            let mut store = ConversationStore::new();
            let loaded: Vec<Conversation> = created
                .iter()
                .enumerate()
                .map(|(i, t)| dm(&format!("{:02}", i), "p", *t, ConsentState::Allowed))
                .collect();
            store.apply_loaded(loaded);

            let sorted = store.sorted();
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].activity_ns() >= pair[1].activity_ns());
                if pair[0].activity_ns() == pair[1].activity_ns() {
                    // insertion order (ids are zero-padded indices)
                    prop_assert!(pair[0].id < pair[1].id);
                }
            }
        }

        #[test]
        fn prop_groups_are_always_allowed(states in proptest::collection::vec(0u8..3, 1..10)) {
            let mut store = ConversationStore::new();
            for (i, s) in states.iter().enumerate() {
                let state = match s { 0 => ConsentState::Unknown, 1 => ConsentState::Allowed, _ => ConsentState::Denied };
                let info = ConversationInfo {
                    id: ConversationId::new(format!("g{}", i)),
                    kind: ConversationKind::Group { name: None },
                    created_at_ns: i as u64,
                };
                store.upsert(Conversation::new(info, state, None));
            }
            prop_assert_eq!(store.view(ConsentState::Allowed).len(), states.len());
        }
    }
}
