//! Messages, system events and pending sends

use super::types::{ConversationId, InboxId, MessageId};
use serde::{Deserialize, Serialize};

/// Delivery state of a locally originated message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

/// Decoded group membership / administration change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Inbox that performed the change, when known
    pub initiated_by: Option<InboxId>,
    pub added: Vec<InboxId>,
    pub removed: Vec<InboxId>,
    pub left: Vec<InboxId>,
    pub admins_added: Vec<InboxId>,
    pub admins_removed: Vec<InboxId>,
    /// Changed metadata fields (e.g. group name) as (field, new value)
    pub metadata_changes: Vec<(String, String)>,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    Text(String),
    System(SystemEvent),
}

impl MessageContent {
    pub fn is_system(&self) -> bool {
        matches!(self, MessageContent::System(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::System(_) => None,
        }
    }
}

/// Message as received from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_inbox_id: InboxId,
    /// Ordering cursor; also the read-position comparison key
    pub sent_at_ns: u64,
    pub content: MessageContent,
}

impl Message {
    pub fn text(
        id: MessageId,
        conversation_id: ConversationId,
        sender_inbox_id: InboxId,
        sent_at_ns: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_inbox_id,
            sent_at_ns,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.content.is_system()
    }
}

/// Locally originated message awaiting network confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_inbox_id: InboxId,
    pub text: String,
    pub created_at_ns: u64,
    pub status: DeliveryStatus,
    /// Network id reported by a successful send, if any
    pub remote_id: Option<MessageId>,
}

/// Short summary of the latest message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_inbox_id: InboxId,
    pub text: String,
    pub sent_at_ns: u64,
}
