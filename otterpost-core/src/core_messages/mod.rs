//! Open-conversation message state
//!
//! - [`store`]: persisted ∪ pending merge and optimistic reconciliation
//! - [`system`]: group event decoding
//! - [`grouping`]: visual grouping of consecutive messages

pub mod grouping;
pub mod store;
pub mod system;

pub use grouping::{group_messages, MessageGroup, DEFAULT_GROUP_GAP};
pub use store::{preview_of, Ingest, MessageStore, TimelineItem};
