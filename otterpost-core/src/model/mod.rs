//! Data model shared by every store

pub mod consent;
pub mod conversation;
pub mod message;
pub mod reputation;
pub mod types;

pub use consent::{ConsentAction, ConsentRecord, ConsentState};
pub use conversation::{Conversation, ConversationInfo, ConversationKind};
pub use message::{
    DeliveryStatus, Message, MessageContent, MessagePreview, PendingMessage, SystemEvent,
};
pub use reputation::ReputationProfile;
pub use types::{now_ns, Address, ConversationId, InboxId, MessageId, NANOS_PER_SEC};
