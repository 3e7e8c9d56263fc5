//! Otterpost core: client-side conversation and message sync engine
//!
//! Keeps a wallet-identified user's conversations, messages, consent
//! decisions, unread counts and peer reputation consistent with the
//! messaging network while live streams, paginated loads and user actions
//! race against each other.
//!
//! Entry points:
//! - [`Engine`]: client lifecycle plus one session per signed-in identity
//! - [`SessionHandle`]: commands and snapshots for the running session
//! - [`core_protocol`]: the collaborator traits a protocol SDK adapter
//!   implements

pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod shutdown;

pub mod core_client;
pub mod core_consent;
pub mod core_conversations;
pub mod core_identity;
pub mod core_messages;
pub mod core_protocol;
pub mod core_reputation;
pub mod core_session;
pub mod core_unread;

pub mod test_utils;

pub use config::Config;
pub use core_session::{Engine, SessionEvent, SessionHandle};
pub use errors::{SyncError, SyncResult, ValidationError};
pub use logging::{init_logging, LogLevel};
