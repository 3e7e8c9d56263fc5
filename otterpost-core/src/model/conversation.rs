//! Conversation previews

use super::consent::ConsentState;
use super::message::MessagePreview;
use super::types::{Address, ConversationId, InboxId};
use serde::{Deserialize, Serialize};

/// Conversation shape as reported by the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Dm {
        peer_inbox_id: InboxId,
        /// Resolved chain address; `None` until resolution succeeds
        peer_address: Option<Address>,
    },
    Group {
        name: Option<String>,
    },
}

/// Raw conversation metadata from the protocol, before preview building
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub created_at_ns: u64,
}

impl ConversationInfo {
    pub fn peer_inbox_id(&self) -> Option<&InboxId> {
        match &self.kind {
            ConversationKind::Dm { peer_inbox_id, .. } => Some(peer_inbox_id),
            ConversationKind::Group { .. } => None,
        }
    }
}

/// Display-ready conversation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub created_at_ns: u64,
    consent_state: ConsentState,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
}

impl Conversation {
    /// Build a preview; groups are always `Allowed`
    pub fn new(
        info: ConversationInfo,
        consent_state: ConsentState,
        last_message: Option<MessagePreview>,
    ) -> Self {
        let mut conversation = Self {
            id: info.id,
            kind: info.kind,
            created_at_ns: info.created_at_ns,
            consent_state: ConsentState::Allowed,
            last_message,
            unread_count: 0,
        };
        conversation.set_consent_state(consent_state);
        conversation
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }

    pub fn consent_state(&self) -> ConsentState {
        self.consent_state
    }

    /// Group consent is not modeled; groups stay `Allowed`
    pub fn set_consent_state(&mut self, state: ConsentState) {
        self.consent_state = if self.is_group() { ConsentState::Allowed } else { state };
    }

    pub fn peer_inbox_id(&self) -> Option<&InboxId> {
        match &self.kind {
            ConversationKind::Dm { peer_inbox_id, .. } => Some(peer_inbox_id),
            ConversationKind::Group { .. } => None,
        }
    }

    pub fn peer_address(&self) -> Option<&Address> {
        match &self.kind {
            ConversationKind::Dm { peer_address, .. } => peer_address.as_ref(),
            ConversationKind::Group { .. } => None,
        }
    }

    /// Sort key: last message time, falling back to creation time
    pub fn activity_ns(&self) -> u64 {
        self.last_message
            .as_ref()
            .map(|m| m.sent_at_ns)
            .unwrap_or(self.created_at_ns)
    }

    /// Display title: group name or peer address
    pub fn title(&self) -> String {
        match &self.kind {
            ConversationKind::Dm { peer_address: Some(address), .. } => address.to_string(),
            ConversationKind::Dm { peer_inbox_id, .. } => peer_inbox_id.short(),
            ConversationKind::Group { name: Some(name) } => name.clone(),
            ConversationKind::Group { name: None } => "Unnamed group".to_string(),
        }
    }
}
