//! Messaging Protocol Collaborator Interface
//!
//! The engine never talks to the network directly. Everything it needs from
//! the messaging protocol is expressed by two traits:
//!
//! - [`ClientFactory`]: builds clients for an address, answers whether local
//!   state can be restored without a signature, manages installations
//! - [`MessagingBackend`]: one live client; conversation, message, consent
//!   and identity operations plus the three live streams
//!
//! # Architecture
//!
//! ```text
//! Session / ClientManager
//!       |
//!       v
//! MessagingBackend (trait)
//!       |
//!       +---> protocol SDK adapter (production)
//!       |
//!       +---> InMemoryBackend (tests, CLI demo)
//! ```
//!
//! Streams are plain `mpsc::Receiver`s; dropping the receiver ends the
//! subscription on the collaborator side.

pub mod errors;
pub mod memory;

pub use errors::{ProtocolError, ProtocolResult};

use crate::model::{
    Address, ConsentRecord, ConsentState, ConversationId, ConversationInfo, InboxId, Message,
    MessageId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A signed-in device registered under an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub id: String,
    pub created_at_ns: u64,
}

/// Failure modes of a wallet signer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    /// User declined the signature prompt
    #[error("signature request rejected")]
    Rejected,
    #[error("signer failed: {0}")]
    Failed(String),
}

/// Wallet signing capability supplied by the host application
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address the signer signs for
    fn address(&self) -> &Address;

    /// Sign the given challenge text
    async fn sign(&self, text: &str) -> Result<Vec<u8>, SignerError>;
}

/// Builds protocol clients and manages per-identity installation state
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Read-only check whether a client can be restored from local state
    /// without a signature. Must not open any exclusive storage handle.
    async fn can_restore(&self, address: &Address) -> ProtocolResult<bool>;

    /// Restore a client from local state (no signature)
    async fn restore(&self, address: &Address) -> ProtocolResult<Arc<dyn MessagingBackend>>;

    /// Create (and register if needed) a client, requesting a signature
    async fn create(
        &self,
        address: &Address,
        signer: &dyn Signer,
    ) -> ProtocolResult<Arc<dyn MessagingBackend>>;

    /// List installations registered for the address's inbox
    async fn installations(&self, address: &Address) -> ProtocolResult<Vec<Installation>>;

    /// Revoke installations; requires a signature
    async fn revoke_installations(
        &self,
        address: &Address,
        installation_ids: &[String],
        signer: &dyn Signer,
    ) -> ProtocolResult<()>;
}

/// One live protocol client; exclusively owns local storage and workers
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    /// Inbox id of the signed-in identity
    fn inbox_id(&self) -> InboxId;

    /// Address of the signed-in identity
    fn address(&self) -> Address;

    /// Pull the latest conversation list from the network into local state
    async fn sync_conversations(&self) -> ProtocolResult<()>;

    async fn list_conversations(&self) -> ProtocolResult<Vec<ConversationInfo>>;

    async fn conversation(&self, id: &ConversationId) -> ProtocolResult<Option<ConversationInfo>>;

    /// Find an existing DM with the peer or create one
    async fn find_or_create_dm(&self, peer: &InboxId) -> ProtocolResult<ConversationInfo>;

    async fn stream_conversations(&self) -> ProtocolResult<mpsc::Receiver<ConversationInfo>>;

    /// Pull the latest messages of one conversation into local state
    async fn sync_conversation(&self, id: &ConversationId) -> ProtocolResult<()>;

    /// Messages of one conversation, ascending by `sent_at_ns`
    async fn list_messages(&self, id: &ConversationId) -> ProtocolResult<Vec<Message>>;

    /// Latest message per conversation, one round trip for the whole batch
    async fn latest_messages(
        &self,
        ids: &[ConversationId],
    ) -> ProtocolResult<HashMap<ConversationId, Message>>;

    /// Send text; returns the network id of the new message
    async fn send_text(&self, id: &ConversationId, text: &str) -> ProtocolResult<MessageId>;

    /// Every new message across all conversations
    async fn stream_all_messages(&self) -> ProtocolResult<mpsc::Receiver<Message>>;

    async fn consent_states(&self, inbox_ids: &[InboxId]) -> ProtocolResult<Vec<ConsentRecord>>;

    /// Set consent for a batch; fails as a whole
    async fn set_consent_states(
        &self,
        inbox_ids: &[InboxId],
        state: ConsentState,
    ) -> ProtocolResult<()>;

    async fn stream_consent(&self) -> ProtocolResult<mpsc::Receiver<ConsentRecord>>;

    /// Addresses for a batch of inbox ids; keys as the network reports them
    async fn addresses_for_inboxes(
        &self,
        inbox_ids: &[InboxId],
    ) -> ProtocolResult<HashMap<String, Address>>;

    /// Inbox registered for an address, if reachable
    async fn inbox_for_address(&self, address: &Address) -> ProtocolResult<Option<InboxId>>;

    async fn send_read_receipt(&self, id: &ConversationId) -> ProtocolResult<()>;

    /// Release the storage handle and stop workers. Synchronous so teardown
    /// completes before a replacement client is built.
    fn close(&self);
}
