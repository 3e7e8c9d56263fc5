//! Error taxonomy for the sync engine
//!
//! Every fallible engine operation returns [`SyncResult`]. The variants map to
//! the classes a UI has to treat differently:
//!
//! - [`SyncError::Transient`]: network/backend failure, retryable by the user
//! - [`SyncError::ResourceLimit`]: the identity hit an installation cap
//! - [`SyncError::Validation`]: rejected locally, no network call was made
//!
//! A rejected wallet signature is *not* an error; see
//! [`crate::core_client::InitOutcome::SignatureRejected`].

use crate::core_protocol::ProtocolError;
use crate::model::ConversationId;
use thiserror::Error;

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or backend failure; safe to retry
    #[error("Network error: {0}")]
    Transient(String),

    /// Too many installations registered for this identity
    #[error("Installation limit reached: {0}")]
    ResourceLimit(String),

    /// Input rejected before any network call
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// No client is ready for the requested operation
    #[error("Client not ready")]
    NotReady,

    /// Conversation not known to the store
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// Operation requires an open conversation
    #[error("No conversation is open")]
    NoOpenConversation,

    /// Pending message not found (already reconciled or discarded)
    #[error("Pending message not found: {0}")]
    PendingNotFound(String),

    /// Local key/value storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The session loop has stopped
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether re-invoking the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Storage(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        if e.is_resource_limit() {
            SyncError::ResourceLimit(e.to_string())
        } else {
            SyncError::Transient(e.to_string())
        }
    }
}

/// Synchronous input validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Not a `0x`-prefixed 20-byte hex address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Attempted to open a conversation with our own address
    #[error("cannot message yourself")]
    SelfMessaging,

    /// A DM with this peer already exists
    #[error("conversation already exists: {0}")]
    DuplicateConversation(ConversationId),

    /// Message body is empty after trimming
    #[error("message is empty")]
    EmptyMessage,

    /// Peer address has no registered inbox
    #[error("address is not reachable: {0}")]
    Unreachable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::ConversationNotFound(ConversationId::new("c1"));
        assert_eq!(err.to_string(), "Conversation not found: c1");

        let err = SyncError::Validation(ValidationError::SelfMessaging);
        assert_eq!(err.to_string(), "Invalid input: cannot message yourself");
    }

    #[test]
    fn test_protocol_error_classification() {
        let limit = ProtocolError::Other(
            "Cannot register a new installation: 10/10 installations".to_string(),
        );
        assert!(matches!(SyncError::from(limit), SyncError::ResourceLimit(_)));

        let network = ProtocolError::Network("connection reset".to_string());
        let err = SyncError::from(network);
        assert!(matches!(err, SyncError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_is_not_retryable() {
        let err: SyncError = ValidationError::EmptyMessage.into();
        assert!(!err.is_retryable());
    }
}
