//! Error types for protocol collaborator calls

use thiserror::Error;

/// Result type for protocol collaborator calls
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Message fragments the protocol uses when an identity has too many
/// installations registered.
const RESOURCE_LIMIT_PATTERNS: &[&str] = &[
    "too many installations",
    "installation limit",
    "cannot register a new installation",
    "max installations",
];

/// Errors reported by the messaging protocol collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Transport failure (timeouts, resets, unreachable host)
    #[error("Network failure: {0}")]
    Network(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The wallet declined to sign
    #[error("Signature rejected")]
    SignatureRejected,

    /// Client was closed; its storage handle is released
    #[error("Client closed")]
    Closed,

    /// Anything else, with the collaborator's message preserved
    #[error("{0}")]
    Other(String),
}

impl ProtocolError {
    /// Detect installation-cap failures from the underlying message
    pub fn is_resource_limit(&self) -> bool {
        let message = match self {
            ProtocolError::Network(m) | ProtocolError::Other(m) => m.to_lowercase(),
            _ => return false,
        };
        RESOURCE_LIMIT_PATTERNS.iter().any(|p| message.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_limit_detection() {
        assert!(ProtocolError::Other("Too many installations (10/10)".into()).is_resource_limit());
        assert!(ProtocolError::Other(
            "build: Cannot register a new installation because the InboxID abc has 10/10".into()
        )
        .is_resource_limit());
        assert!(!ProtocolError::Other("database locked".into()).is_resource_limit());
        assert!(!ProtocolError::SignatureRejected.is_resource_limit());
    }
}
