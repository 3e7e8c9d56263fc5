//! Consent states and records

use super::types::InboxId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-contact trust classification governing visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsentState {
    /// No decision yet (message requests)
    #[default]
    Unknown,
    /// Contact is trusted
    Allowed,
    /// Contact is blocked
    Denied,
}

impl ConsentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentState::Unknown => "unknown",
            ConsentState::Allowed => "allowed",
            ConsentState::Denied => "denied",
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User-initiated consent change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentAction {
    Allow,
    Deny,
    /// Explicit reset; the only path back to `Unknown`
    Reset,
}

impl ConsentAction {
    pub fn target_state(&self) -> ConsentState {
        match self {
            ConsentAction::Allow => ConsentState::Allowed,
            ConsentAction::Deny => ConsentState::Denied,
            ConsentAction::Reset => ConsentState::Unknown,
        }
    }
}

/// Consent state for one inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub inbox_id: InboxId,
    pub state: ConsentState,
    pub last_updated_ns: u64,
}

impl ConsentRecord {
    pub fn new(inbox_id: InboxId, state: ConsentState, last_updated_ns: u64) -> Self {
        Self { inbox_id, state, last_updated_ns }
    }
}
