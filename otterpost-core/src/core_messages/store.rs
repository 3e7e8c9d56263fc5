//! Message Store
//!
//! Canonical message list for the open conversation, merged with optimistic
//! pending sends. The displayed timeline is recomputed from
//! `persisted ∪ pending` on every change, ascending by `sent_at_ns`.
//!
//! Reconciliation of a newly persisted message from self:
//!
//! 1. a pending entry whose recorded network id equals the message id
//! 2. otherwise the oldest non-failed pending entry without a network id and
//!    with identical text, created no later than the message (allowing for
//!    clock skew)
//!
//! Duplicates (already persisted ids) are dropped before reconciliation, so a
//! replayed echo can never consume a second pending entry.

use super::grouping::{group_messages, MessageGroup};
use super::system;
use crate::errors::{SyncError, SyncResult, ValidationError};
use crate::model::{
    ConversationId, DeliveryStatus, InboxId, Message, MessageContent, MessageId, MessagePreview,
    PendingMessage, NANOS_PER_SEC,
};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, trace};

/// Tolerated skew between the local clock and network timestamps
const RECONCILE_SKEW_NS: u64 = 60 * NANOS_PER_SEC;

/// Display-ready entry of the merged timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineItem {
    /// Network id, or the local id for pending sends
    pub id: MessageId,
    pub sender_inbox_id: InboxId,
    pub sent_at_ns: u64,
    /// Body text; decoded description for system messages
    pub text: String,
    pub is_system: bool,
    /// `Sent` for every persisted message
    pub status: DeliveryStatus,
}

impl TimelineItem {
    fn from_message(message: &Message) -> Self {
        let text = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::System(event) => system::describe(event),
        };
        Self {
            id: message.id.clone(),
            sender_inbox_id: message.sender_inbox_id.clone(),
            sent_at_ns: message.sent_at_ns,
            text,
            is_system: message.is_system(),
            status: DeliveryStatus::Sent,
        }
    }

    fn from_pending(pending: &PendingMessage) -> Self {
        Self {
            id: pending.local_id.clone(),
            sender_inbox_id: pending.sender_inbox_id.clone(),
            sent_at_ns: pending.created_at_ns,
            text: pending.text.clone(),
            is_system: false,
            status: pending.status,
        }
    }
}

/// Outcome of merging one network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// New message; no pending entry matched
    Inserted,
    /// New message that replaced the given pending entry
    Reconciled(MessageId),
    /// Already persisted; dropped
    Duplicate,
    /// Belongs to another conversation; dropped
    WrongConversation,
}

impl Ingest {
    pub fn is_new(&self) -> bool {
        matches!(self, Ingest::Inserted | Ingest::Reconciled(_))
    }
}

/// Build a conversation preview from a network message
pub fn preview_of(message: &Message) -> MessagePreview {
    let text = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::System(event) => system::describe(event),
    };
    MessagePreview {
        message_id: message.id.clone(),
        sender_inbox_id: message.sender_inbox_id.clone(),
        text,
        sent_at_ns: message.sent_at_ns,
    }
}

#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    self_inbox_id: InboxId,
    persisted: Vec<Message>,
    persisted_ids: HashSet<MessageId>,
    pending: Vec<PendingMessage>,
    timeline: Vec<TimelineItem>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, self_inbox_id: InboxId) -> Self {
        Self {
            conversation_id,
            self_inbox_id,
            persisted: Vec::new(),
            persisted_ids: HashSet::new(),
            pending: Vec::new(),
            timeline: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn timeline(&self) -> &[TimelineItem] {
        &self.timeline
    }

    pub fn groups(&self, gap: Duration) -> Vec<MessageGroup> {
        group_messages(&self.timeline, gap)
    }

    pub fn persisted(&self) -> &[Message] {
        &self.persisted
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn latest(&self) -> Option<&Message> {
        self.persisted.last()
    }

    /// Merge a listed page; stream arrivals already merged stay deduplicated
    pub fn load(&mut self, messages: Vec<Message>) -> usize {
        let inserted = messages
            .into_iter()
            .filter(|m| self.merge(m.clone()).is_new())
            .count();
        self.rebuild();
        debug!(conversation_id = %self.conversation_id, inserted, "Loaded messages");
        inserted
    }

    /// Merge one network message (stream arrival)
    pub fn ingest(&mut self, message: Message) -> Ingest {
        let outcome = self.merge(message);
        if outcome.is_new() {
            self.rebuild();
        }
        outcome
    }

    fn merge(&mut self, message: Message) -> Ingest {
        if message.conversation_id != self.conversation_id {
            return Ingest::WrongConversation;
        }
        if self.persisted_ids.contains(&message.id) {
            trace!(message_id = %message.id, "Duplicate message dropped");
            return Ingest::Duplicate;
        }

        let reconciled = self.match_pending(&message).map(|index| self.pending.remove(index).local_id);

        let position = self
            .persisted
            .partition_point(|m| m.sent_at_ns <= message.sent_at_ns);
        self.persisted_ids.insert(message.id.clone());
        self.persisted.insert(position, message);

        match reconciled {
            Some(local_id) => Ingest::Reconciled(local_id),
            None => Ingest::Inserted,
        }
    }

    fn match_pending(&self, message: &Message) -> Option<usize> {
        if message.sender_inbox_id != self.self_inbox_id {
            return None;
        }
        if let Some(index) = self
            .pending
            .iter()
            .position(|p| p.remote_id.as_ref() == Some(&message.id))
        {
            return Some(index);
        }
        let text = message.content.as_text()?;
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.status != DeliveryStatus::Failed
                    && p.remote_id.is_none()
                    && p.text == text
                    && p.created_at_ns <= message.sent_at_ns.saturating_add(RECONCILE_SKEW_NS)
            })
            .min_by_key(|(_, p)| p.created_at_ns)
            .map(|(index, _)| index)
    }

    /// Append an optimistic pending message
    pub fn begin_send(&mut self, text: &str, now_ns: u64) -> SyncResult<PendingMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let pending = PendingMessage {
            local_id: MessageId::generate_local(),
            conversation_id: self.conversation_id.clone(),
            sender_inbox_id: self.self_inbox_id.clone(),
            text: text.to_string(),
            created_at_ns: now_ns,
            status: DeliveryStatus::Sending,
            remote_id: None,
        };
        self.pending.push(pending.clone());
        self.rebuild();
        Ok(pending)
    }

    /// Send returned a network id; the echo may already have arrived
    pub fn send_succeeded(&mut self, local_id: &MessageId, remote_id: MessageId) {
        let Some(index) = self.pending.iter().position(|p| &p.local_id == local_id) else {
            return;
        };
        if self.persisted_ids.contains(&remote_id) {
            self.pending.remove(index);
        } else {
            let pending = &mut self.pending[index];
            pending.status = DeliveryStatus::Sent;
            pending.remote_id = Some(remote_id);
        }
        self.rebuild();
    }

    pub fn send_failed(&mut self, local_id: &MessageId) {
        if let Some(pending) = self.pending.iter_mut().find(|p| &p.local_id == local_id) {
            pending.status = DeliveryStatus::Failed;
            self.rebuild();
        }
    }

    /// Flip a failed pending message back to `Sending` for another attempt
    pub fn retry(&mut self, local_id: &MessageId) -> SyncResult<PendingMessage> {
        let pending = self
            .pending
            .iter_mut()
            .find(|p| &p.local_id == local_id && p.status == DeliveryStatus::Failed)
            .ok_or_else(|| SyncError::PendingNotFound(local_id.to_string()))?;
        pending.status = DeliveryStatus::Sending;
        let pending = pending.clone();
        self.rebuild();
        Ok(pending)
    }

    /// Remove a failed pending message
    pub fn discard(&mut self, local_id: &MessageId) -> SyncResult<()> {
        let index = self
            .pending
            .iter()
            .position(|p| &p.local_id == local_id && p.status == DeliveryStatus::Failed)
            .ok_or_else(|| SyncError::PendingNotFound(local_id.to_string()))?;
        self.pending.remove(index);
        self.rebuild();
        Ok(())
    }

    fn rebuild(&mut self) {
        let mut timeline: Vec<TimelineItem> = self
            .persisted
            .iter()
            .map(TimelineItem::from_message)
            .chain(self.pending.iter().map(TimelineItem::from_pending))
            .collect();
        timeline.sort_by_key(|item| item.sent_at_ns);
        self.timeline = timeline;
    }
}
